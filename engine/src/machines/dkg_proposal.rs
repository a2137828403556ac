//! Distributed key generation machine.
//!
//! A linear pipeline of four broadcast rounds: commits, deals, responses,
//! master key. Every round waits for a contribution from each quorum member;
//! a validator auto event advances the pipeline once all are in, cancels on
//! the first participant error (all N contributions are required), or on
//! expiry. The master-key round additionally requires every published group
//! key to be byte-identical.

use std::sync::{Arc, Mutex};

use crate::config;
use crate::fsm::{
    BuildError, CallbackResult, Event, EventDesc, EventRunMode, Fsm, FsmError, State,
};

use super::payload::{DkgConfirmation, DkgProposalParticipant, DkgStatus, RoundPayload};
use super::requests::FsmRequest;
use super::responses::{
    DkgCommitEntry, DkgCommitsParticipantResponse, DkgDealEntry, DkgDealsParticipantResponse,
    DkgPubKeyEntry, DkgPubKeysParticipantResponse, DkgResponseEntry,
    DkgResponsesParticipantResponse, FsmResponse,
};
use super::signature_proposal::STATE_SIG_PROPOSAL_COLLECTED;
use super::{bind, ActionResult, MachineFsm};

pub const MACHINE_NAME: &str = "dkg_proposal_fsm";

pub const STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS: State =
    State::new("state_dkg_commits_await_confirmations");
pub const STATE_DKG_COMMITS_CANCELED_BY_ERROR: State =
    State::new("state_dkg_commits_await_canceled_by_error");
pub const STATE_DKG_COMMITS_CANCELED_BY_TIMEOUT: State =
    State::new("state_dkg_commits_await_canceled_by_timeout");

pub const STATE_DKG_DEALS_AWAIT_CONFIRMATIONS: State =
    State::new("state_dkg_deals_await_confirmations");
pub const STATE_DKG_DEALS_CANCELED_BY_ERROR: State =
    State::new("state_dkg_deals_await_canceled_by_error");
pub const STATE_DKG_DEALS_CANCELED_BY_TIMEOUT: State =
    State::new("state_dkg_deals_await_canceled_by_timeout");

pub const STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS: State =
    State::new("state_dkg_responses_await_confirmations");
pub const STATE_DKG_RESPONSES_CANCELED_BY_ERROR: State =
    State::new("state_dkg_responses_await_canceled_by_error");
pub const STATE_DKG_RESPONSES_CANCELED_BY_TIMEOUT: State =
    State::new("state_dkg_responses_await_canceled_by_timeout");

pub const STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS: State =
    State::new("state_dkg_master_key_await_confirmations");
pub const STATE_DKG_MASTER_KEY_CANCELED_BY_ERROR: State =
    State::new("state_dkg_master_key_await_canceled_by_error");
pub const STATE_DKG_MASTER_KEY_CANCELED_BY_TIMEOUT: State =
    State::new("state_dkg_master_key_await_canceled_by_timeout");

pub const STATE_DKG_MASTER_KEY_COLLECTED: State = State::new("state_dkg_master_key_collected");

pub const EVENT_DKG_INIT_PROCESS: Event = Event::new("event_dkg_init_process");
pub const EVENT_DKG_COMMIT_CONFIRM_RECEIVED: Event =
    Event::new("event_dkg_commit_confirm_received");
pub const EVENT_DKG_COMMIT_CONFIRM_ERROR: Event = Event::new("event_dkg_commit_confirm_error");
pub const EVENT_DKG_DEAL_CONFIRM_RECEIVED: Event = Event::new("event_dkg_deal_confirm_received");
pub const EVENT_DKG_DEAL_CONFIRM_ERROR: Event = Event::new("event_dkg_deal_confirm_error");
pub const EVENT_DKG_RESPONSE_CONFIRM_RECEIVED: Event =
    Event::new("event_dkg_response_confirm_received");
pub const EVENT_DKG_RESPONSE_CONFIRM_ERROR: Event =
    Event::new("event_dkg_response_confirm_error");
pub const EVENT_DKG_MASTER_KEY_CONFIRM_RECEIVED: Event =
    Event::new("event_dkg_master_key_confirm_received");
pub const EVENT_DKG_MASTER_KEY_CONFIRM_ERROR: Event =
    Event::new("event_dkg_master_key_confirm_error");

const EVENT_VALIDATE_COMMITS: Event = Event::new("event_dkg_commits_validate_internal");
const EVENT_COMMITS_CONFIRMED: Event = Event::new("event_dkg_commits_confirmed_internal");
const EVENT_COMMITS_CANCELED_BY_ERROR: Event =
    Event::new("event_dkg_commits_canceled_by_error_internal");
const EVENT_COMMITS_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_dkg_commits_canceled_by_timeout_internal");

const EVENT_VALIDATE_DEALS: Event = Event::new("event_dkg_deals_validate_internal");
const EVENT_DEALS_CONFIRMED: Event = Event::new("event_dkg_deals_confirmed_internal");
const EVENT_DEALS_CANCELED_BY_ERROR: Event =
    Event::new("event_dkg_deals_canceled_by_error_internal");
const EVENT_DEALS_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_dkg_deals_canceled_by_timeout_internal");

const EVENT_VALIDATE_RESPONSES: Event = Event::new("event_dkg_responses_validate_internal");
const EVENT_RESPONSES_CONFIRMED: Event = Event::new("event_dkg_responses_confirmed_internal");
const EVENT_RESPONSES_CANCELED_BY_ERROR: Event =
    Event::new("event_dkg_responses_canceled_by_error_internal");
const EVENT_RESPONSES_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_dkg_responses_canceled_by_timeout_internal");

const EVENT_VALIDATE_MASTER_KEY: Event = Event::new("event_dkg_master_key_validate_internal");
const EVENT_MASTER_KEY_CONFIRMED: Event = Event::new("event_dkg_master_key_confirmed_internal");
const EVENT_MASTER_KEY_CANCELED_BY_ERROR: Event =
    Event::new("event_dkg_master_key_canceled_by_error_internal");
const EVENT_MASTER_KEY_CANCELED_BY_TIMEOUT: Event =
    Event::new("event_dkg_master_key_canceled_by_timeout_internal");

pub(crate) const SOURCE_STATES: &[State] = &[
    STATE_SIG_PROPOSAL_COLLECTED,
    STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
    STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
    STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
    STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
];

pub(crate) const ALL_STATES: &[State] = &[
    STATE_SIG_PROPOSAL_COLLECTED,
    STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
    STATE_DKG_COMMITS_CANCELED_BY_ERROR,
    STATE_DKG_COMMITS_CANCELED_BY_TIMEOUT,
    STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
    STATE_DKG_DEALS_CANCELED_BY_ERROR,
    STATE_DKG_DEALS_CANCELED_BY_TIMEOUT,
    STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
    STATE_DKG_RESPONSES_CANCELED_BY_ERROR,
    STATE_DKG_RESPONSES_CANCELED_BY_TIMEOUT,
    STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
    STATE_DKG_MASTER_KEY_CANCELED_BY_ERROR,
    STATE_DKG_MASTER_KEY_CANCELED_BY_TIMEOUT,
    STATE_DKG_MASTER_KEY_COLLECTED,
];

pub fn new(payload: Arc<Mutex<RoundPayload>>) -> Result<MachineFsm, BuildError> {
    let events = vec![
        EventDesc::new(
            EVENT_DKG_INIT_PROCESS,
            vec![STATE_SIG_PROPOSAL_COLLECTED],
            STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
        ),
        // Commits round.
        EventDesc::new(
            EVENT_DKG_COMMIT_CONFIRM_RECEIVED,
            vec![STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS],
            STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_DKG_COMMIT_CONFIRM_ERROR,
            vec![STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS],
            STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_COMMITS,
            vec![STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS],
            STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_COMMITS_CONFIRMED,
            vec![STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS],
            STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
        )
        .internal(),
        EventDesc::new(
            EVENT_COMMITS_CANCELED_BY_ERROR,
            vec![STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS],
            STATE_DKG_COMMITS_CANCELED_BY_ERROR,
        )
        .internal(),
        EventDesc::new(
            EVENT_COMMITS_CANCELED_BY_TIMEOUT,
            vec![STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS],
            STATE_DKG_COMMITS_CANCELED_BY_TIMEOUT,
        )
        .internal(),
        // Deals round.
        EventDesc::new(
            EVENT_DKG_DEAL_CONFIRM_RECEIVED,
            vec![STATE_DKG_DEALS_AWAIT_CONFIRMATIONS],
            STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_DKG_DEAL_CONFIRM_ERROR,
            vec![STATE_DKG_DEALS_AWAIT_CONFIRMATIONS],
            STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_DEALS,
            vec![STATE_DKG_DEALS_AWAIT_CONFIRMATIONS],
            STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_DEALS_CONFIRMED,
            vec![STATE_DKG_DEALS_AWAIT_CONFIRMATIONS],
            STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
        )
        .internal(),
        EventDesc::new(
            EVENT_DEALS_CANCELED_BY_ERROR,
            vec![STATE_DKG_DEALS_AWAIT_CONFIRMATIONS],
            STATE_DKG_DEALS_CANCELED_BY_ERROR,
        )
        .internal(),
        EventDesc::new(
            EVENT_DEALS_CANCELED_BY_TIMEOUT,
            vec![STATE_DKG_DEALS_AWAIT_CONFIRMATIONS],
            STATE_DKG_DEALS_CANCELED_BY_TIMEOUT,
        )
        .internal(),
        // Responses round.
        EventDesc::new(
            EVENT_DKG_RESPONSE_CONFIRM_RECEIVED,
            vec![STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS],
            STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_DKG_RESPONSE_CONFIRM_ERROR,
            vec![STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS],
            STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_RESPONSES,
            vec![STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS],
            STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_RESPONSES_CONFIRMED,
            vec![STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
        )
        .internal(),
        EventDesc::new(
            EVENT_RESPONSES_CANCELED_BY_ERROR,
            vec![STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS],
            STATE_DKG_RESPONSES_CANCELED_BY_ERROR,
        )
        .internal(),
        EventDesc::new(
            EVENT_RESPONSES_CANCELED_BY_TIMEOUT,
            vec![STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS],
            STATE_DKG_RESPONSES_CANCELED_BY_TIMEOUT,
        )
        .internal(),
        // Master-key round.
        EventDesc::new(
            EVENT_DKG_MASTER_KEY_CONFIRM_RECEIVED,
            vec![STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_DKG_MASTER_KEY_CONFIRM_ERROR,
            vec![STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
        ),
        EventDesc::new(
            EVENT_VALIDATE_MASTER_KEY,
            vec![STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
        )
        .internal()
        .auto(EventRunMode::After),
        EventDesc::new(
            EVENT_MASTER_KEY_CONFIRMED,
            vec![STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_COLLECTED,
        )
        .internal(),
        EventDesc::new(
            EVENT_MASTER_KEY_CANCELED_BY_ERROR,
            vec![STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_CANCELED_BY_ERROR,
        )
        .internal(),
        EventDesc::new(
            EVENT_MASTER_KEY_CANCELED_BY_TIMEOUT,
            vec![STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS],
            STATE_DKG_MASTER_KEY_CANCELED_BY_TIMEOUT,
        )
        .internal(),
    ];

    let mut callbacks = crate::fsm::Callbacks::new();
    callbacks.insert(EVENT_DKG_INIT_PROCESS, bind(&payload, action_init_dkg));
    callbacks.insert(
        EVENT_DKG_COMMIT_CONFIRM_RECEIVED,
        bind(&payload, action_commit_received),
    );
    callbacks.insert(
        EVENT_DKG_DEAL_CONFIRM_RECEIVED,
        bind(&payload, action_deal_received),
    );
    callbacks.insert(
        EVENT_DKG_RESPONSE_CONFIRM_RECEIVED,
        bind(&payload, action_response_received),
    );
    callbacks.insert(
        EVENT_DKG_MASTER_KEY_CONFIRM_RECEIVED,
        bind(&payload, action_master_key_received),
    );
    for error_event in [
        EVENT_DKG_COMMIT_CONFIRM_ERROR,
        EVENT_DKG_DEAL_CONFIRM_ERROR,
        EVENT_DKG_RESPONSE_CONFIRM_ERROR,
        EVENT_DKG_MASTER_KEY_CONFIRM_ERROR,
    ] {
        callbacks.insert(error_event, bind(&payload, action_confirmation_error));
    }
    callbacks.insert(EVENT_VALIDATE_COMMITS, bind(&payload, action_validate_commits));
    callbacks.insert(EVENT_VALIDATE_DEALS, bind(&payload, action_validate_deals));
    callbacks.insert(
        EVENT_VALIDATE_RESPONSES,
        bind(&payload, action_validate_responses),
    );
    callbacks.insert(
        EVENT_VALIDATE_MASTER_KEY,
        bind(&payload, action_validate_master_key),
    );

    Fsm::new(MACHINE_NAME, STATE_SIG_PROPOSAL_COLLECTED, events, callbacks)
}

fn action_init_dkg(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::Default(request) = request else {
        return Err(FsmError::error("expected a default request for dkg init"));
    };

    let sig = payload
        .signature_proposal
        .as_ref()
        .ok_or_else(|| FsmError::error("signature proposal is not initialized"))?;

    let quorum = sig
        .quorum
        .iter()
        .map(|(id, p)| {
            (
                *id,
                DkgProposalParticipant {
                    username: p.username.clone(),
                    pub_key: p.pub_key.clone(),
                    status: DkgStatus::CommitAwaitConfirmation,
                    commit: Vec::new(),
                    deals: Vec::new(),
                    responses: Vec::new(),
                    master_key: Vec::new(),
                    error: None,
                    updated_at: request.created_at,
                },
            )
        })
        .collect();

    let threshold = sig.threshold;
    payload.dkg_proposal = Some(DkgConfirmation {
        quorum,
        threshold,
        created_at: request.created_at,
        expires_at: request.created_at + config::dkg_confirmation_deadline(),
        updated_at: request.created_at,
    });

    let dkg = payload.dkg_proposal.as_ref().expect("just installed");
    let participants = dkg
        .quorum
        .iter()
        .map(|(id, p)| DkgPubKeyEntry {
            participant_id: *id,
            username: p.username.clone(),
            dkg_pub_key: p.pub_key.clone(),
        })
        .collect();

    Ok(CallbackResult::with_data(FsmResponse::DkgPubKeys(
        DkgPubKeysParticipantResponse {
            threshold,
            participants,
        },
    )))
}

fn dkg_participant_mut<'a>(
    payload: &'a mut RoundPayload,
    participant_id: usize,
) -> Result<(&'a mut DkgConfirmation, usize), FsmError> {
    let dkg = payload
        .dkg_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("dkg proposal is not initialized"))?;
    if !dkg.quorum.contains_key(&participant_id) {
        return Err(FsmError::error("participant does not exist in quorum"));
    }
    Ok((dkg, participant_id))
}

fn action_commit_received(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::DkgCommitConfirmation(request) = request else {
        return Err(FsmError::error("expected a commit confirmation request"));
    };
    request.validate()?;

    let (dkg, id) = dkg_participant_mut(payload, request.participant_id)?;
    let participant = dkg.quorum.get_mut(&id).expect("checked above");
    if participant.status != DkgStatus::CommitAwaitConfirmation {
        return Err(FsmError::error(format!(
            "cannot accept commit with status {:?}",
            participant.status
        )));
    }
    participant.commit = request.commit.clone();
    participant.status = DkgStatus::CommitConfirmed;
    participant.updated_at = request.created_at;
    dkg.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_deal_received(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::DkgDealConfirmation(request) = request else {
        return Err(FsmError::error("expected a deal confirmation request"));
    };
    request.validate()?;

    let (dkg, id) = dkg_participant_mut(payload, request.participant_id)?;
    let participant = dkg.quorum.get_mut(&id).expect("checked above");
    if participant.status != DkgStatus::DealAwaitConfirmation {
        return Err(FsmError::error(format!(
            "cannot accept deals with status {:?}",
            participant.status
        )));
    }
    participant.deals = request.deals.clone();
    participant.status = DkgStatus::DealConfirmed;
    participant.updated_at = request.created_at;
    dkg.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_response_received(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::DkgResponseConfirmation(request) = request else {
        return Err(FsmError::error("expected a response confirmation request"));
    };
    request.validate()?;

    let (dkg, id) = dkg_participant_mut(payload, request.participant_id)?;
    let participant = dkg.quorum.get_mut(&id).expect("checked above");
    if participant.status != DkgStatus::ResponseAwaitConfirmation {
        return Err(FsmError::error(format!(
            "cannot accept responses with status {:?}",
            participant.status
        )));
    }
    participant.responses = request.responses.clone();
    participant.status = DkgStatus::ResponseConfirmed;
    participant.updated_at = request.created_at;
    dkg.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_master_key_received(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::DkgMasterKeyConfirmation(request) = request else {
        return Err(FsmError::error("expected a master key confirmation request"));
    };
    request.validate()?;

    let (dkg, id) = dkg_participant_mut(payload, request.participant_id)?;
    let participant = dkg.quorum.get_mut(&id).expect("checked above");
    if participant.status != DkgStatus::MasterKeyAwaitConfirmation {
        return Err(FsmError::error(format!(
            "cannot accept master key with status {:?}",
            participant.status
        )));
    }
    participant.master_key = request.master_key.clone();
    participant.status = DkgStatus::MasterKeyConfirmed;
    participant.updated_at = request.created_at;
    dkg.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

fn action_confirmation_error(
    payload: &mut RoundPayload,
    event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let FsmRequest::ConfirmationError(request) = request else {
        return Err(FsmError::error("expected a confirmation error request"));
    };

    let (expected, failed) = if *event == EVENT_DKG_COMMIT_CONFIRM_ERROR {
        (DkgStatus::CommitAwaitConfirmation, DkgStatus::CommitError)
    } else if *event == EVENT_DKG_DEAL_CONFIRM_ERROR {
        (DkgStatus::DealAwaitConfirmation, DkgStatus::DealError)
    } else if *event == EVENT_DKG_RESPONSE_CONFIRM_ERROR {
        (DkgStatus::ResponseAwaitConfirmation, DkgStatus::ResponseError)
    } else if *event == EVENT_DKG_MASTER_KEY_CONFIRM_ERROR {
        (
            DkgStatus::MasterKeyAwaitConfirmation,
            DkgStatus::MasterKeyError,
        )
    } else {
        return Err(FsmError::error(format!(
            "event \"{event}\" cannot be used for a confirmation error"
        )));
    };

    let (dkg, id) = dkg_participant_mut(payload, request.participant_id)?;
    let participant = dkg.quorum.get_mut(&id).expect("checked above");
    if participant.status != expected {
        return Err(FsmError::error(format!(
            "cannot report error for participant with status {:?}",
            participant.status
        )));
    }
    participant.status = failed;
    participant.error = Some(request.error.description.clone());
    participant.updated_at = request.created_at;
    dkg.updated_at = request.created_at;

    Ok(CallbackResult::stay())
}

/// Outcome of one round's quorum scan.
struct RoundTally {
    confirmed: usize,
    failed: usize,
    total: usize,
}

fn tally(dkg: &DkgConfirmation, confirmed: DkgStatus, failed: DkgStatus) -> RoundTally {
    let mut result = RoundTally {
        confirmed: 0,
        failed: 0,
        total: dkg.quorum.len(),
    };
    for participant in dkg.quorum.values() {
        if participant.status == confirmed {
            result.confirmed += 1;
        } else if participant.status == failed {
            result.failed += 1;
        }
    }
    result
}

fn action_validate_commits(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let dkg = payload
        .dkg_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("dkg proposal is not initialized"))?;

    if dkg.is_expired_at(now) {
        return Ok(CallbackResult::reroute(EVENT_COMMITS_CANCELED_BY_TIMEOUT));
    }
    let counts = tally(dkg, DkgStatus::CommitConfirmed, DkgStatus::CommitError);
    if counts.failed > 0 {
        return Ok(CallbackResult::reroute(EVENT_COMMITS_CANCELED_BY_ERROR));
    }
    if counts.confirmed < counts.total {
        return Ok(CallbackResult::stay());
    }

    for participant in dkg.quorum.values_mut() {
        participant.status = DkgStatus::DealAwaitConfirmation;
    }
    let participants = dkg
        .quorum
        .iter()
        .map(|(id, p)| DkgCommitEntry {
            participant_id: *id,
            username: p.username.clone(),
            commit: p.commit.clone(),
        })
        .collect();

    Ok(CallbackResult::reroute_with_data(
        EVENT_COMMITS_CONFIRMED,
        FsmResponse::DkgCommits(DkgCommitsParticipantResponse { participants }),
    ))
}

fn action_validate_deals(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let dkg = payload
        .dkg_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("dkg proposal is not initialized"))?;

    if dkg.is_expired_at(now) {
        return Ok(CallbackResult::reroute(EVENT_DEALS_CANCELED_BY_TIMEOUT));
    }
    let counts = tally(dkg, DkgStatus::DealConfirmed, DkgStatus::DealError);
    if counts.failed > 0 {
        return Ok(CallbackResult::reroute(EVENT_DEALS_CANCELED_BY_ERROR));
    }
    if counts.confirmed < counts.total {
        return Ok(CallbackResult::stay());
    }

    for participant in dkg.quorum.values_mut() {
        participant.status = DkgStatus::ResponseAwaitConfirmation;
    }
    let participants = dkg
        .quorum
        .iter()
        .map(|(id, p)| DkgDealEntry {
            participant_id: *id,
            username: p.username.clone(),
            deals: p.deals.clone(),
        })
        .collect();

    Ok(CallbackResult::reroute_with_data(
        EVENT_DEALS_CONFIRMED,
        FsmResponse::DkgDeals(DkgDealsParticipantResponse { participants }),
    ))
}

fn action_validate_responses(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let dkg = payload
        .dkg_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("dkg proposal is not initialized"))?;

    if dkg.is_expired_at(now) {
        return Ok(CallbackResult::reroute(EVENT_RESPONSES_CANCELED_BY_TIMEOUT));
    }
    let counts = tally(dkg, DkgStatus::ResponseConfirmed, DkgStatus::ResponseError);
    if counts.failed > 0 {
        return Ok(CallbackResult::reroute(EVENT_RESPONSES_CANCELED_BY_ERROR));
    }
    if counts.confirmed < counts.total {
        return Ok(CallbackResult::stay());
    }

    for participant in dkg.quorum.values_mut() {
        participant.status = DkgStatus::MasterKeyAwaitConfirmation;
    }
    let participants = dkg
        .quorum
        .iter()
        .map(|(id, p)| DkgResponseEntry {
            participant_id: *id,
            username: p.username.clone(),
            responses: p.responses.clone(),
        })
        .collect();

    Ok(CallbackResult::reroute_with_data(
        EVENT_RESPONSES_CONFIRMED,
        FsmResponse::DkgResponses(DkgResponsesParticipantResponse { participants }),
    ))
}

fn action_validate_master_key(
    payload: &mut RoundPayload,
    _event: &Event,
    request: &FsmRequest,
) -> ActionResult {
    let now = request.occurred_at();
    let dkg = payload
        .dkg_proposal
        .as_mut()
        .ok_or_else(|| FsmError::error("dkg proposal is not initialized"))?;

    if dkg.is_expired_at(now) {
        return Ok(CallbackResult::reroute(
            EVENT_MASTER_KEY_CANCELED_BY_TIMEOUT,
        ));
    }
    let counts = tally(
        dkg,
        DkgStatus::MasterKeyConfirmed,
        DkgStatus::MasterKeyError,
    );
    if counts.failed > 0 {
        return Ok(CallbackResult::reroute(EVENT_MASTER_KEY_CANCELED_BY_ERROR));
    }
    if counts.confirmed < counts.total {
        return Ok(CallbackResult::stay());
    }

    // All published master keys must agree byte for byte.
    let mut keys = dkg.quorum.values().map(|p| &p.master_key);
    let first = keys.next().expect("quorum is never empty");
    if !keys.all(|key| key == first) {
        for participant in dkg.quorum.values_mut() {
            if participant.error.is_none() {
                participant.error = Some("master key mismatch".to_owned());
            }
        }
        return Ok(CallbackResult::reroute(EVENT_MASTER_KEY_CANCELED_BY_ERROR));
    }

    Ok(CallbackResult::reroute(EVENT_MASTER_KEY_CONFIRMED))
}
