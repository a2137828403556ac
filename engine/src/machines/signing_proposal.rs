//! Batch signing machine.
//!
//! After a round's master key is collected the machine idles until an
//! initiator proposes a batch of messages. Participants confirm or decline;
//! once enough confirm (`unconfirmed <= N - T`) the quorum moves to partial
//! signing, and once enough partial signatures arrive the batch is collected
//! for reconstruction. `signing_restart` returns to idle for the next batch.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config;
use crate::fsm::{
    BuildError, CallbackResult, Event, EventDesc, EventRunMode, Fsm, FsmError, State,
};

use super::dkg_proposal::STATE_DKG_MASTER_KEY_COLLECTED;
use super::payload::{
    RoundPayload, SigningConfirmation, SigningProposalParticipant, SigningStatus,
};
use super::requests::FsmRequest;
use super::responses::{
    FsmResponse, SigningParticipantEntry, SigningParticipantInvitationsResponse,
    SigningPartialSignsInvitationsResponse, SigningProcessEntry,
    SigningProcessParticipantResponse,
};
use super::{bind, ActionResult, MachineFsm};

pub const MACHINE_NAME: &str = "signing_proposal_fsm";

pub const STATE_SIGNING_IDLE: State = State::new("state_signing_idle");
pub const STATE_SIGNING_AWAIT_CONFIRMATIONS: State =
    State::new("state_signing_await_confirmations");
pub const STATE_SIGNING_AWAIT_PARTIAL_SIGNS: State =
    State::new("state_signing_await_partial_signs");
pub const STATE_SIGNING_PARTIAL_SIGNS_COLLECTED: State =
    State::new("state_signing_partial_signs_collected");
pub const STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_TIMEOUT: State =
    State::new("state_signing_confirmations_canceled_by_timeout");
pub const STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_PARTICIPANT: State =
    State::new("state_signing_confirmations_canceled_by_participant");
pub const STATE_SIGNING_PARTIAL_SIGNS_CANCELED_BY_TIMEOUT: State =
    State::new("state_signing_partial_signs_canceled_by_timeout");
pub const STATE_SIGNING_PARTIAL_SIGNS_CANCELED_BY_ERROR: State =
    State::new("state_signing_partial_signs_canceled_by_error");

pub const EVENT_SIGNING_INIT: Event = Event::new("event_signing_init");
pub const EVENT_SIGNING_START: Event = Event::new("event_signing_start");
pub const EVENT_CONFIRM_SIGNING: Event = Event::new("event_signing_confirm_by_participant");
pub const EVENT_DECLINE_SIGNING: Event = Event::new("event_signing_decline_by_participant");
pub const EVENT_SIGNING_PARTIAL_SIGN_RECEIVED: Event =
    Event::new("event_signing_partial_sign_received");
pub const EVENT_SIGNING_PARTIAL_SIGN_ERROR: Event =
    Event::new("event_signing_partial_sign_error");
pub const EVENT_SIGNING_RESTART: Event = Event::new("event_signing_restart");

const EVENT_VALIDATE_CONFIRMATIONS: Event =
    Event::new("event_signing_confirmations_validate_internal");
const EVENT_SET_SIGNING_CONFIRMED: Event = Event::new("event_signing_confirmed_internal");
const EVENT_CONFIRMATIONS_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_signing_confirmations_canceled_by_timeout_internal");
const EVENT_CONFIRMATIONS_CANCELED_BY_PARTICIPANT: Event =
    Event::new("event_signing_confirmations_canceled_by_participant_internal");

const EVENT_VALIDATE_PARTIAL_SIGNS: Event =
    Event::new("event_signing_partial_signs_validate_internal");
const EVENT_PARTIAL_SIGNS_COLLECTED: Event =
    Event::new("event_signing_partial_signs_collected_internal");
const EVENT_PARTIAL_SIGNS_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_signing_partial_signs_canceled_by_timeout_internal");
const EVENT_PARTIAL_SIGNS_CANCELED_BY_ERROR: Event =
    Event::new("event_signing_partial_signs_canceled_by_error_internal");

pub(crate) const SOURCE_STATES: &[State] = &[
    STATE_DKG_MASTER_KEY_COLLECTED,
    STATE_SIGNING_IDLE,
    STATE_SIGNING_AWAIT_CONFIRMATIONS,
    STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
    STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
];

pub(crate) const ALL_STATES: &[State] = &[
    STATE_DKG_MASTER_KEY_COLLECTED,
    STATE_SIGNING_IDLE,
    STATE_SIGNING_AWAIT_CONFIRMATIONS,
    STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
    STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
    STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_TIMEOUT,
    STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_PARTICIPANT,
    STATE_SIGNING_PARTIAL_SIGNS_CANCELED_BY_TIMEOUT,
    STATE_SIGNING_PARTIAL_SIGNS_CANCELED_BY_ERROR,
];

pub fn new(payload: Arc<Mutex<RoundPayload>>) -> Result<MachineFsm, BuildError> {
    let events = vec![
        EventDesc::new(
            EVENT_SIGNING_INIT,
            vec![STATE_DKG_MASTER_KEY_COLLECTED],
            STATE_SIGNING_IDLE,
        ),
        EventDesc::new(
            EVENT_SIGNING_START,
            vec![STATE_SIGNING_IDLE],
            STATE_SIGNING_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_CONFIRM_SIGNING,
            vec![STATE_SIGNING_AWAIT_CONFIRMATIONS],
            STATE_SIGNING_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_DECLINE_SIGNING,
            vec![STATE_SIGNING_AWAIT_CONFIRMATIONS],
            STATE_SIGNING_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_CONFIRMATIONS,
            vec![STATE_SIGNING_AWAIT_CONFIRMATIONS],
            STATE_SIGNING_AWAIT_CONFIRMATIONS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_SET_SIGNING_CONFIRMED,
            vec![STATE_SIGNING_AWAIT_CONFIRMATIONS],
            STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        )
        .internal(),
        EventDesc::new(
            EVENT_CONFIRMATIONS_CANCELED_BY_TIMEOUT,
            vec![STATE_SIGNING_AWAIT_CONFIRMATIONS],
            STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_TIMEOUT,
        )
        .internal(),
        EventDesc::new(
            EVENT_CONFIRMATIONS_CANCELED_BY_PARTICIPANT,
            vec![STATE_SIGNING_AWAIT_CONFIRMATIONS],
            STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_PARTICIPANT,
        )
        .internal(),
        EventDesc::new(
            EVENT_SIGNING_PARTIAL_SIGN_RECEIVED,
            vec![STATE_SIGNING_AWAIT_PARTIAL_SIGNS],
            STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        ),
        EventDesc::new(
            EVENT_SIGNING_PARTIAL_SIGN_ERROR,
            vec![STATE_SIGNING_AWAIT_PARTIAL_SIGNS],
            STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_PARTIAL_SIGNS,
            vec![STATE_SIGNING_AWAIT_PARTIAL_SIGNS],
            STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_PARTIAL_SIGNS_COLLECTED,
            vec![STATE_SIGNING_AWAIT_PARTIAL_SIGNS],
            STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
        )
        .internal(),
        EventDesc::new(
            EVENT_PARTIAL_SIGNS_CANCELED_BY_TIMEOUT,
            vec![STATE_SIGNING_AWAIT_PARTIAL_SIGNS],
            STATE_SIGNING_PARTIAL_SIGNS_CANCELED_BY_TIMEOUT,
        )
        .internal(),
        EventDesc::new(
            EVENT_PARTIAL_SIGNS_CANCELED_BY_ERROR,
            vec![STATE_SIGNING_AWAIT_PARTIAL_SIGNS],
            STATE_SIGNING_PARTIAL_SIGNS_CANCELED_BY_ERROR,
        )
        .internal(),
        EventDesc::new(
            EVENT_SIGNING_RESTART,
            vec![STATE_SIGNING_PARTIAL_SIGNS_COLLECTED],
            STATE_SIGNING_IDLE,
        ),
    ];

    let mut callbacks = crate::fsm::Callbacks::new();
    callbacks.insert(EVENT_SIGNING_INIT, bind(&payload, action_init_signing));
    callbacks.insert(EVENT_SIGNING_START, bind(&payload, action_start_signing));
    callbacks.insert(
        EVENT_CONFIRM_SIGNING,
        bind(&payload, action_signing_response),
    );
    callbacks.insert(
        EVENT_DECLINE_SIGNING,
        bind(&payload, action_signing_response),
    );
    callbacks.insert(
        EVENT_VALIDATE_CONFIRMATIONS,
        bind(&payload, action_validate_confirmations),
    );
    callbacks.insert(
        EVENT_SIGNING_PARTIAL_SIGN_RECEIVED,
        bind(&payload, action_partial_sign_received),
    );
    callbacks.insert(
        EVENT_SIGNING_PARTIAL_SIGN_ERROR,
        bind(&payload, action_partial_sign_error),
    );
    callbacks.insert(
        EVENT_VALIDATE_PARTIAL_SIGNS,
        bind(&payload, action_validate_partial_signs),
    );
    callbacks.insert(EVENT_SIGNING_RESTART, bind(&payload, action_init_signing));

    Fsm::new(MACHINE_NAME, STATE_DKG_MASTER_KEY_COLLECTED, events, callbacks)
}

/// Installs an empty signing sub-payload; used both on first entry and on
/// restart after a collected batch.
fn action_init_signing(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::Default(request) = request else {
        return Err(FsmError::error("expected a default request for signing init"));
    };

    payload.signing_proposal = Some(SigningConfirmation {
        batch_id: String::new(),
        initiator_id: 0,
        src_payload: Vec::new(),
        quorum: BTreeMap::new(),
        created_at: request.created_at,
        expires_at: request.created_at + config::signing_confirmation_deadline(),
        updated_at: request.created_at,
    });

    Ok(CallbackResult::stay())
}

fn action_start_signing(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::SigningStart(request) = request else {
        return Err(FsmError::error("expected a signing start request"));
    };
    request.validate()?;

    let dkg = payload
        .dkg_proposal
        .as_ref()
        .ok_or_else(|| FsmError::error("dkg proposal is not initialized"))?;
    if !dkg.quorum.contains_key(&request.participant_id) {
        return Err(FsmError::error("initiator does not exist in quorum"));
    }

    let mut quorum = BTreeMap::new();
    for (id, participant) in &dkg.quorum {
        quorum.insert(
            *id,
            SigningProposalParticipant {
                username: participant.username.clone(),
                status: SigningStatus::AwaitConfirmation,
                partial_signs: Vec::new(),
                error: None,
                updated_at: request.created_at,
            },
        );
    }
    quorum
        .get_mut(&request.participant_id)
        .expect("checked above")
        .status = SigningStatus::Confirmed;

    let signing = payload
        .signing_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signing proposal is not initialized"))?;
    signing.batch_id = request.batch_id.clone();
    signing.initiator_id = request.participant_id;
    signing.src_payload = request.src_payload.clone();
    signing.quorum = quorum;
    signing.created_at = request.created_at;
    signing.expires_at = request.created_at + config::signing_confirmation_deadline();
    signing.updated_at = request.created_at;

    let participants = signing
        .quorum
        .iter()
        .map(|(id, p)| SigningParticipantEntry {
            participant_id: *id,
            username: p.username.clone(),
            status: p.status.as_str().to_owned(),
        })
        .collect();

    Ok(CallbackResult::with_data(FsmResponse::SigningInvitations(
        SigningParticipantInvitationsResponse {
            batch_id: signing.batch_id.clone(),
            initiator_id: signing.initiator_id,
            src_payload: signing.src_payload.clone(),
            participants,
        },
    )))
}

fn action_signing_response(
    payload: &mut RoundPayload,
    event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::SigningParticipant(request) = request else {
        return Err(FsmError::error("expected a signing participant request"));
    };

    let signing = payload
        .signing_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signing proposal is not initialized"))?;
    let participant = signing
        .quorum
        .get_mut(&request.participant_id)
        .ok_or_else(|| FsmError::error("participant does not exist in quorum"))?;

    if participant.status != SigningStatus::AwaitConfirmation {
        return Err(FsmError::error(format!(
            "cannot confirm participant with status \"{}\"",
            participant.status.as_str()
        )));
    }

    participant.status = if *event == EVENT_CONFIRM_SIGNING {
        SigningStatus::Confirmed
    } else if *event == EVENT_DECLINE_SIGNING {
        SigningStatus::Declined
    } else {
        return Err(FsmError::error(format!(
            "unsupported event \"{event}\" for signing response"
        )));
    };

    participant.updated_at = request.created_at;
    signing.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_validate_confirmations(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let threshold = payload.threshold();
    let signing = payload
        .signing_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signing proposal is not initialized"))?;

    if signing.is_expired_at(now) {
        return Ok(CallbackResult::reroute(
            EVENT_CONFIRMATIONS_CANCELED_BY_TIMEOUT,
        ));
    }

    let total = signing.quorum.len();
    let declines = signing
        .quorum
        .values()
        .filter(|p| p.status == SigningStatus::Declined)
        .count();
    let confirmed = signing
        .quorum
        .values()
        .filter(|p| p.status == SigningStatus::Confirmed)
        .count();

    if declines > total - threshold {
        return Ok(CallbackResult::reroute(
            EVENT_CONFIRMATIONS_CANCELED_BY_PARTICIPANT,
        ));
    }
    if total - confirmed > total - threshold {
        return Ok(CallbackResult::stay());
    }

    for participant in signing.quorum.values_mut() {
        participant.status = SigningStatus::AwaitPartialSign;
    }

    Ok(CallbackResult::reroute_with_data(
        EVENT_SET_SIGNING_CONFIRMED,
        FsmResponse::SigningPartialSignsInvitations(SigningPartialSignsInvitationsResponse {
            batch_id: signing.batch_id.clone(),
            initiator_id: signing.initiator_id,
            src_payload: signing.src_payload.clone(),
        }),
    ))
}

fn action_partial_sign_received(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::SigningPartialSigns(request) = request else {
        return Err(FsmError::error("expected a partial signs request"));
    };
    request.validate()?;

    let signing = payload
        .signing_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signing proposal is not initialized"))?;
    let participant = signing
        .quorum
        .get_mut(&request.participant_id)
        .ok_or_else(|| FsmError::error("participant does not exist in quorum"))?;

    if participant.status != SigningStatus::AwaitPartialSign {
        return Err(FsmError::error(format!(
            "cannot accept partial signs with status \"{}\"",
            participant.status.as_str()
        )));
    }

    participant.partial_signs = request.partial_signs.clone();
    participant.status = SigningStatus::PartialSignConfirmed;
    participant.updated_at = request.created_at;
    signing.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_partial_sign_error(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::ConfirmationError(request) = request else {
        return Err(FsmError::error("expected a confirmation error request"));
    };

    let signing = payload
        .signing_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signing proposal is not initialized"))?;
    let participant = signing
        .quorum
        .get_mut(&request.participant_id)
        .ok_or_else(|| FsmError::error("participant does not exist in quorum"))?;

    match participant.status {
        SigningStatus::AwaitPartialSign => participant.status = SigningStatus::Error,
        SigningStatus::PartialSignConfirmed => {
            return Err(FsmError::error("participant already confirmed"))
        }
        SigningStatus::Error => {
            return Err(FsmError::error("participant already reported an error"))
        }
        _ => {
            return Err(FsmError::error(format!(
                "cannot report error for participant with status \"{}\"",
                participant.status.as_str()
            )))
        }
    }

    participant.error = Some(request.error.description.clone());
    participant.updated_at = request.created_at;
    signing.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_validate_partial_signs(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let threshold = payload.threshold();
    let signing = payload
        .signing_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signing proposal is not initialized"))?;

    if signing.is_expired_at(now) {
        return Ok(CallbackResult::reroute(
            EVENT_PARTIAL_SIGNS_CANCELED_BY_TIMEOUT,
        ));
    }

    let total = signing.quorum.len();
    let failed = signing
        .quorum
        .values()
        .filter(|p| p.status == SigningStatus::Error)
        .count();
    let confirmed = signing
        .quorum
        .values()
        .filter(|p| p.status == SigningStatus::PartialSignConfirmed)
        .count();

    if failed > total - threshold {
        return Ok(CallbackResult::reroute(
            EVENT_PARTIAL_SIGNS_CANCELED_BY_ERROR,
        ));
    }
    if total - confirmed > total - threshold {
        return Ok(CallbackResult::stay());
    }

    // Participants that never delivered a partial signature are left out of
    // the reconstruction payload.
    let participants: Vec<SigningProcessEntry> = signing
        .quorum
        .iter()
        .filter(|(_, p)| !p.partial_signs.is_empty())
        .map(|(id, p)| SigningProcessEntry {
            participant_id: *id,
            username: p.username.clone(),
            partial_signs: p.partial_signs.clone(),
        })
        .collect();

    let missing = total - participants.len();
    let warning = (missing > 0).then(|| {
        FsmError::warn(format!(
            "{missing} quorum members delivered no partial signatures for batch {}",
            signing.batch_id
        ))
    });

    Ok(CallbackResult {
        out_event: Some(EVENT_PARTIAL_SIGNS_COLLECTED),
        data: Some(FsmResponse::SigningProcess(SigningProcessParticipantResponse {
            batch_id: signing.batch_id.clone(),
            src_payload: signing.src_payload.clone(),
            participants,
        })),
        warning,
    })
}
