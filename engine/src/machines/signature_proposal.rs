//! Participant roll-call machine.
//!
//! A round begins here: the initiator publishes the quorum roster and the
//! signing threshold, every participant confirms or declines, and the
//! validator closes the proposal — collected on full confirmation, canceled
//! on the first decline or on expiry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config;
use crate::fsm::{
    BuildError, CallbackResult, Event, EventDesc, EventRunMode, Fsm, FsmError, State,
    STATE_GLOBAL_IDLE,
};

use super::payload::{
    RoundPayload, SignatureConfirmation, SignatureProposalParticipant, SignatureProposalStatus,
};
use super::requests::FsmRequest;
use super::responses::{
    FsmResponse, SignatureProposalEntry, SignatureProposalParticipantsResponse,
};
use super::{bind, ActionResult, MachineFsm};

pub const MACHINE_NAME: &str = "signature_proposal_fsm";

pub const STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS: State =
    State::new("state_sig_proposal_await_participants_confirmations");
pub const STATE_SIG_PROPOSAL_COLLECTED: State = State::new("state_sig_proposal_collected");
pub const STATE_SIG_PROPOSAL_CANCELED_BY_TIMEOUT: State =
    State::new("state_sig_proposal_canceled_by_timeout");
pub const STATE_SIG_PROPOSAL_CANCELED_BY_PARTICIPANT: State =
    State::new("state_sig_proposal_canceled_by_participant");

pub const EVENT_INIT_PROPOSAL: Event = Event::new("event_sig_proposal_init");
pub const EVENT_CONFIRM_PROPOSAL: Event =
    Event::new("event_sig_proposal_confirm_by_participant");
pub const EVENT_DECLINE_PROPOSAL: Event =
    Event::new("event_sig_proposal_decline_by_participant");

const EVENT_VALIDATE_PROPOSAL: Event = Event::new("event_sig_proposal_validate_internal");
const EVENT_SET_PROPOSAL_COLLECTED: Event =
    Event::new("event_sig_proposal_set_collected_internal");
const EVENT_SET_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_sig_proposal_canceled_by_timeout_internal");
const EVENT_SET_CANCELED_BY_PARTICIPANT: Event =
    Event::new("event_sig_proposal_canceled_by_participant_internal");

pub(crate) const SOURCE_STATES: &[State] =
    &[STATE_GLOBAL_IDLE, STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS];

pub(crate) const ALL_STATES: &[State] = &[
    STATE_GLOBAL_IDLE,
    STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS,
    STATE_SIG_PROPOSAL_COLLECTED,
    STATE_SIG_PROPOSAL_CANCELED_BY_TIMEOUT,
    STATE_SIG_PROPOSAL_CANCELED_BY_PARTICIPANT,
];

pub fn new(payload: Arc<Mutex<RoundPayload>>) -> Result<MachineFsm, BuildError> {
    let events = vec![
        EventDesc::new(
            EVENT_INIT_PROPOSAL,
            vec![STATE_GLOBAL_IDLE],
            STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_CONFIRM_PROPOSAL,
            vec![STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS],
            STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_DECLINE_PROPOSAL,
            vec![STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS],
            STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_PROPOSAL,
            vec![STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS],
            STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_SET_PROPOSAL_COLLECTED,
            vec![STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS],
            STATE_SIG_PROPOSAL_COLLECTED,
        )
        .internal(),
        EventDesc::new(
            EVENT_SET_CANCELED_BY_TIMEOUT,
            vec![STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS],
            STATE_SIG_PROPOSAL_CANCELED_BY_TIMEOUT,
        )
        .internal(),
        EventDesc::new(
            EVENT_SET_CANCELED_BY_PARTICIPANT,
            vec![STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS],
            STATE_SIG_PROPOSAL_CANCELED_BY_PARTICIPANT,
        )
        .internal(),
    ];

    let mut callbacks = crate::fsm::Callbacks::new();
    callbacks.insert(EVENT_INIT_PROPOSAL, bind(&payload, action_init_proposal));
    callbacks.insert(
        EVENT_CONFIRM_PROPOSAL,
        bind(&payload, action_proposal_response),
    );
    callbacks.insert(
        EVENT_DECLINE_PROPOSAL,
        bind(&payload, action_proposal_response),
    );
    callbacks.insert(
        EVENT_VALIDATE_PROPOSAL,
        bind(&payload, action_validate_proposal),
    );

    Fsm::new(MACHINE_NAME, STATE_GLOBAL_IDLE, events, callbacks)
}

fn action_init_proposal(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::ProposalInit(request) = request else {
        return Err(FsmError::error(
            "expected a participants list request for proposal init",
        ));
    };
    request.validate()?;

    let mut quorum = BTreeMap::new();
    for (id, entry) in request.participants.iter().enumerate() {
        quorum.insert(
            id,
            SignatureProposalParticipant {
                username: entry.username.clone(),
                pub_key: entry.pub_key.clone(),
                status: SignatureProposalStatus::AwaitConfirmation,
                updated_at: request.created_at,
            },
        );
    }

    payload.signature_proposal = Some(SignatureConfirmation {
        quorum,
        threshold: request.signing_threshold,
        created_at: request.created_at,
        expires_at: request.created_at + config::signature_proposal_deadline(),
        updated_at: request.created_at,
    });

    Ok(CallbackResult::with_data(participants_response(payload)?))
}

fn action_proposal_response(
    payload: &mut RoundPayload,
    event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::ProposalParticipant(request) = request else {
        return Err(FsmError::error(
            "expected a participant request for proposal confirmation",
        ));
    };

    let sig = payload
        .signature_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("signature proposal is not initialized"))?;
    let participant = sig
        .quorum
        .get_mut(&request.participant_id)
        .ok_or_else(|| FsmError::error("participant does not exist in quorum"))?;

    if participant.status != SignatureProposalStatus::AwaitConfirmation {
        return Err(FsmError::error(format!(
            "cannot confirm participant with status \"{}\"",
            participant.status.as_str()
        )));
    }

    participant.status = if *event == EVENT_CONFIRM_PROPOSAL {
        SignatureProposalStatus::Confirmed
    } else if *event == EVENT_DECLINE_PROPOSAL {
        SignatureProposalStatus::Declined
    } else {
        return Err(FsmError::error(format!(
            "unsupported event \"{event}\" for proposal response"
        )));
    };

    participant.updated_at = request.created_at;
    sig.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_validate_proposal(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let sig = payload
        .signature_proposal
        .as_ref()
        .ok_or_else(|| FsmError::error("signature proposal is not initialized"))?;

    if sig.is_expired_at(now) {
        return Ok(CallbackResult::reroute(EVENT_SET_CANCELED_BY_TIMEOUT));
    }

    let declines = sig
        .quorum
        .values()
        .filter(|p| p.status == SignatureProposalStatus::Declined)
        .count();
    if declines >= 1 {
        return Ok(CallbackResult::reroute(EVENT_SET_CANCELED_BY_PARTICIPANT));
    }

    let unconfirmed = sig
        .quorum
        .values()
        .filter(|p| p.status != SignatureProposalStatus::Confirmed)
        .count();
    if unconfirmed > 0 {
        return Ok(CallbackResult::stay());
    }

    Ok(CallbackResult::reroute_with_data(
        EVENT_SET_PROPOSAL_COLLECTED,
        participants_response(payload)?,
    ))
}

fn participants_response(payload: &RoundPayload) -> Result<FsmResponse, FsmError> {
    let sig = payload
        .signature_proposal
        .as_ref()
        .ok_or_else(|| FsmError::error("signature proposal is not initialized"))?;
    let participants = sig
        .quorum
        .iter()
        .map(|(id, p)| SignatureProposalEntry {
            participant_id: *id,
            username: p.username.clone(),
            status: p.status.as_str().to_owned(),
        })
        .collect();
    Ok(FsmResponse::SignatureProposalParticipants(
        SignatureProposalParticipantsResponse {
            threshold: sig.threshold,
            participants,
        },
    ))
}
