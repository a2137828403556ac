//! Shared harness: N air-gapped machines plus a node simulation that drives
//! one FSM instance the way the ordered broadcast log would.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tempfile::TempDir;

use crate::airgapped::Machine;
use crate::fsm::{Event, FsmError, Response, State};
use crate::machines::payload::SigningMessage;
use crate::machines::requests::{
    DefaultRequest, FsmRequest, ProposalParticipantEntry, SignatureProposalParticipantRequest,
    SignatureProposalParticipantsListRequest, SigningParticipantRequest, SigningStartRequest,
};
use crate::machines::responses::{
    DkgPubKeysParticipantResponse, SigningPartialSignsInvitationsResponse,
    SigningProcessParticipantResponse,
};
use crate::machines::{dkg_proposal, signature_proposal, signing_proposal};
use crate::machines::{FsmInstance, FsmResponse};
use crate::types::{Message, Operation};

pub struct TestNode {
    pub username: String,
    pub machine: Machine,
    pub pub_key: Vec<u8>,
    pub dir: TempDir,
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn spawn_nodes(n: usize) -> Vec<TestNode> {
    (0..n)
        .map(|i| {
            let dir = tempfile::tempdir().expect("tempdir");
            let machine = Machine::new(dir.path().join("keystore"), dir.path().join("results"))
                .expect("machine");
            machine
                .set_encryption_key(format!("passphrase-{i}").as_bytes())
                .expect("encryption key");
            machine.init_keys().expect("init keys");
            let pub_key = machine.pub_key_bytes().expect("pub key");
            TestNode {
                username: format!("node{i}"),
                machine,
                pub_key,
                dir,
            }
        })
        .collect()
}

/// Hand one operation over the air gap and read back the reply file.
pub fn run_operation(
    node: &TestNode,
    state: State,
    payload: &impl Serialize,
    dkg_id: &str,
    store: bool,
) -> Operation {
    let operation = Operation::new(
        dkg_id,
        serde_json::to_vec(payload).expect("payload"),
        state,
        t0(),
    );
    let path = node
        .machine
        .process_operation(operation, store)
        .expect("process operation");
    let raw = std::fs::read(path).expect("read reply file");
    serde_json::from_slice(&raw).expect("decode reply")
}

/// Restore the instance from its dump, apply one event, and check the dump
/// round-trips onto the new state.
pub fn apply_event(
    dump: &[u8],
    event: &Event,
    request: &FsmRequest,
) -> Result<(Response<FsmResponse>, Vec<u8>), FsmError> {
    let mut instance = FsmInstance::from_dump(dump)?;
    let (response, new_dump) = instance.apply(event, request)?;
    let restored = FsmInstance::from_dump(&new_dump).expect("dump round-trip");
    assert_eq!(restored.state(), response.state);
    Ok((response, new_dump))
}

/// Feed one bus message into the round's machine.
pub fn feed(dump: &[u8], msg: &Message) -> Result<(Response<FsmResponse>, Vec<u8>), FsmError> {
    let request = FsmRequest::from_message(&msg.event, &msg.data)?;
    apply_event(dump, &msg.event, &request)
}

/// Feed messages in order until the machine reaches `target`, returning the
/// validator's response data. Messages arriving after the transition are
/// discarded, as a node would.
pub fn feed_until(dump: &mut Vec<u8>, msgs: &[Message], target: &State) -> Option<FsmResponse> {
    let mut last = None;
    for msg in msgs {
        let current = FsmInstance::from_dump(dump).expect("restore").state();
        if current == *target {
            break;
        }
        let (response, new_dump) = feed(dump, msg).expect("feed message");
        *dump = new_dump;
        if response.data.is_some() {
            last = response.data;
        }
    }
    assert_eq!(
        FsmInstance::from_dump(dump).expect("restore").state(),
        *target
    );
    last
}

/// Roll-call: init the proposal and confirm every participant.
/// Returns the dump at `state_sig_proposal_collected`.
pub fn enroll(nodes: &[TestNode], dkg_id: &str, threshold: usize) -> Vec<u8> {
    let instance = FsmInstance::create(dkg_id).expect("create instance");
    let mut dump = instance.dump().expect("dump");

    let request = FsmRequest::ProposalInit(SignatureProposalParticipantsListRequest {
        participants: nodes
            .iter()
            .map(|node| ProposalParticipantEntry {
                username: node.username.clone(),
                pub_key: node.pub_key.clone(),
            })
            .collect(),
        signing_threshold: threshold,
        created_at: t0(),
    });
    let (response, new_dump) =
        apply_event(&dump, &signature_proposal::EVENT_INIT_PROPOSAL, &request)
            .expect("init proposal");
    assert_eq!(
        response.state,
        signature_proposal::STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS
    );
    dump = new_dump;

    for id in 0..nodes.len() {
        let request = FsmRequest::ProposalParticipant(SignatureProposalParticipantRequest {
            participant_id: id,
            created_at: t0(),
        });
        let (_, new_dump) =
            apply_event(&dump, &signature_proposal::EVENT_CONFIRM_PROPOSAL, &request)
                .expect("confirm proposal");
        dump = new_dump;
    }

    assert_eq!(
        FsmInstance::from_dump(&dump).expect("restore").state(),
        signature_proposal::STATE_SIG_PROPOSAL_COLLECTED
    );
    dump
}

/// Returned by [`run_dkg`]: the dump at master-key collection plus the
/// commits-round payload, kept for replay tests.
pub struct DkgRun {
    pub dump: Vec<u8>,
    pub pub_keys: DkgPubKeysParticipantResponse,
}

/// Drive the whole four-round DKG to `state_dkg_master_key_collected`.
pub fn run_dkg(nodes: &[TestNode], dkg_id: &str, threshold: usize) -> DkgRun {
    let mut dump = enroll(nodes, dkg_id, threshold);

    let (response, new_dump) = apply_event(
        &dump,
        &dkg_proposal::EVENT_DKG_INIT_PROCESS,
        &FsmRequest::Default(DefaultRequest { created_at: t0() }),
    )
    .expect("dkg init");
    dump = new_dump;
    let Some(FsmResponse::DkgPubKeys(pub_keys)) = response.data else {
        panic!("expected a pub keys response");
    };

    // Commits round.
    let mut msgs = Vec::new();
    for node in nodes {
        let result = run_operation(
            node,
            dkg_proposal::STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
            &pub_keys,
            dkg_id,
            true,
        );
        assert_eq!(
            result.event,
            Some(dkg_proposal::EVENT_DKG_COMMIT_CONFIRM_RECEIVED)
        );
        assert_eq!(result.result_msgs.len(), 1);
        msgs.extend(result.result_msgs);
    }
    let commits = feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
    );
    let Some(FsmResponse::DkgCommits(commits)) = commits else {
        panic!("expected a commits response");
    };

    // Deals round.
    let mut msgs = Vec::new();
    for node in nodes {
        let result = run_operation(
            node,
            dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
            &commits,
            dkg_id,
            true,
        );
        assert_eq!(
            result.event,
            Some(dkg_proposal::EVENT_DKG_DEAL_CONFIRM_RECEIVED)
        );
        assert_eq!(result.result_msgs.len(), 1);
        msgs.extend(result.result_msgs);
    }
    let deals = feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
    );
    let Some(FsmResponse::DkgDeals(deals)) = deals else {
        panic!("expected a deals response");
    };

    // Responses round.
    let mut msgs = Vec::new();
    for node in nodes {
        let result = run_operation(
            node,
            dkg_proposal::STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS,
            &deals,
            dkg_id,
            true,
        );
        assert_eq!(
            result.event,
            Some(dkg_proposal::EVENT_DKG_RESPONSE_CONFIRM_RECEIVED)
        );
        msgs.extend(result.result_msgs);
    }
    let responses = feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
    );
    let Some(FsmResponse::DkgResponses(responses)) = responses else {
        panic!("expected a responses response");
    };

    // Master-key round.
    let mut msgs = Vec::new();
    for node in nodes {
        let result = run_operation(
            node,
            dkg_proposal::STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS,
            &responses,
            dkg_id,
            true,
        );
        assert_eq!(
            result.event,
            Some(dkg_proposal::EVENT_DKG_MASTER_KEY_CONFIRM_RECEIVED)
        );
        msgs.extend(result.result_msgs);
    }
    feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_MASTER_KEY_COLLECTED,
    );

    DkgRun { dump, pub_keys }
}

/// Returned by [`run_signing`]: the dump at partial-sign collection and the
/// reconstruction payload.
pub struct SigningRun {
    pub dump: Vec<u8>,
    pub process: SigningProcessParticipantResponse,
    pub invitations: SigningPartialSignsInvitationsResponse,
}

/// Drive one signing batch to `state_signing_partial_signs_collected`.
pub fn run_signing(
    nodes: &[TestNode],
    dkg_id: &str,
    dump: Vec<u8>,
    batch_id: &str,
    batch: Vec<SigningMessage>,
) -> SigningRun {
    let mut dump = dump;

    let (_, new_dump) = apply_event(
        &dump,
        &signing_proposal::EVENT_SIGNING_INIT,
        &FsmRequest::Default(DefaultRequest { created_at: t0() }),
    )
    .expect("signing init");
    dump = new_dump;

    let request = FsmRequest::SigningStart(SigningStartRequest {
        batch_id: batch_id.to_owned(),
        participant_id: 0,
        src_payload: batch,
        created_at: t0(),
    });
    let (response, new_dump) =
        apply_event(&dump, &signing_proposal::EVENT_SIGNING_START, &request)
            .expect("signing start");
    dump = new_dump;

    // With T = 1 the initiator's auto-confirmation is already enough and
    // the validator fires on start; otherwise the rest confirm until it
    // moves the quorum to partial signing.
    let mut invitations = None;
    if let Some(FsmResponse::SigningPartialSignsInvitations(data)) = response.data {
        invitations = Some(data);
    } else {
        assert_eq!(
            response.state,
            signing_proposal::STATE_SIGNING_AWAIT_CONFIRMATIONS
        );
    }
    for id in 1..nodes.len() {
        let current = FsmInstance::from_dump(&dump).expect("restore").state();
        if current == signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS {
            break;
        }
        let request = FsmRequest::SigningParticipant(SigningParticipantRequest {
            batch_id: batch_id.to_owned(),
            participant_id: id,
            created_at: t0(),
        });
        let (response, new_dump) =
            apply_event(&dump, &signing_proposal::EVENT_CONFIRM_SIGNING, &request)
                .expect("confirm signing");
        dump = new_dump;
        if let Some(FsmResponse::SigningPartialSignsInvitations(data)) = response.data {
            invitations = Some(data);
        }
    }
    let invitations = invitations.expect("expected partial signs invitations");

    let mut msgs = Vec::new();
    for node in nodes {
        let result = run_operation(
            node,
            signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
            &invitations,
            dkg_id,
            false,
        );
        assert_eq!(
            result.event,
            Some(signing_proposal::EVENT_SIGNING_PARTIAL_SIGN_RECEIVED)
        );
        msgs.extend(result.result_msgs);
    }
    let process = feed_until(
        &mut dump,
        &msgs,
        &signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
    );
    let Some(FsmResponse::SigningProcess(process)) = process else {
        panic!("expected a signing process response");
    };

    SigningRun {
        dump,
        process,
        invitations,
    }
}
