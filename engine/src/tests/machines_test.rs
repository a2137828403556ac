//! Cancellation branches: declines, participant errors, timeouts.

use chrono::Duration;

use crate::fsm::STATE_GLOBAL_IDLE;
use crate::machines::requests::{
    FsmRequest, ProposalParticipantEntry, SignatureProposalParticipantRequest,
    SignatureProposalParticipantsListRequest, SigningParticipantRequest,
};
use crate::machines::responses::DkgCommitEntry;
use crate::machines::{dkg_proposal, signature_proposal, signing_proposal};
use crate::machines::{FsmInstance, FsmResponse};
use crate::machines::payload::SigningMessage;

use super::helpers::{
    apply_event, enroll, feed, feed_until, run_dkg, run_operation, run_signing, spawn_nodes, t0,
};

fn init_proposal_dump(nodes: &[super::helpers::TestNode], dkg_id: &str, threshold: usize) -> Vec<u8> {
    let instance = FsmInstance::create(dkg_id).expect("create instance");
    assert_eq!(instance.state(), STATE_GLOBAL_IDLE);
    let dump = instance.dump().expect("dump");

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
    let (_, dump) = apply_event(&dump, &signature_proposal::EVENT_INIT_PROPOSAL, &request)
        .expect("init proposal");
    dump
}

#[test]
fn proposal_cancels_on_first_decline() {
    let nodes = spawn_nodes(3);
    let dump = init_proposal_dump(&nodes, "round-decline", 2);

    let request = FsmRequest::ProposalParticipant(SignatureProposalParticipantRequest {
        participant_id: 1,
        created_at: t0(),
    });
    let (response, _) = apply_event(&dump, &signature_proposal::EVENT_DECLINE_PROPOSAL, &request)
        .expect("decline proposal");
    assert_eq!(
        response.state,
        signature_proposal::STATE_SIG_PROPOSAL_CANCELED_BY_PARTICIPANT
    );
}

#[test]
fn proposal_cancels_on_timeout() {
    let nodes = spawn_nodes(3);
    let dump = init_proposal_dump(&nodes, "round-timeout", 2);

    let mut instance = FsmInstance::from_dump(&dump).expect("restore");
    let (response, _) = instance
        .tick(t0() + Duration::hours(25))
        .expect("tick past deadline");
    assert_eq!(
        response.state,
        signature_proposal::STATE_SIG_PROPOSAL_CANCELED_BY_TIMEOUT
    );
}

#[test]
fn invalid_threshold_is_rejected() {
    let nodes = spawn_nodes(2);
    let instance = FsmInstance::create("round-threshold").expect("create instance");
    let dump = instance.dump().expect("dump");

    let request = FsmRequest::ProposalInit(SignatureProposalParticipantsListRequest {
        participants: nodes
            .iter()
            .map(|node| ProposalParticipantEntry {
                username: node.username.clone(),
                pub_key: node.pub_key.clone(),
            })
            .collect(),
        signing_threshold: 3,
        created_at: t0(),
    });
    let err = apply_event(&dump, &signature_proposal::EVENT_INIT_PROPOSAL, &request)
        .unwrap_err();
    assert!(err.message.contains("signing threshold"));
}

#[test]
fn dkg_round_cancels_on_deal_error() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-deal-error";

    let mut dump = enroll(&nodes, dkg_id, 2);
    let (response, new_dump) = apply_event(
        &dump,
        &dkg_proposal::EVENT_DKG_INIT_PROCESS,
        &FsmRequest::Default(crate::machines::requests::DefaultRequest { created_at: t0() }),
    )
    .expect("dkg init");
    dump = new_dump;
    let Some(FsmResponse::DkgPubKeys(pub_keys)) = response.data else {
        panic!("expected a pub keys response");
    };

    let mut msgs = Vec::new();
    for node in &nodes {
        let result = run_operation(
            node,
            dkg_proposal::STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
            &pub_keys,
            dkg_id,
            true,
        );
        msgs.extend(result.result_msgs);
    }
    let commits = feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
    );
    let Some(FsmResponse::DkgCommits(mut commits)) = commits else {
        panic!("expected a commits response");
    };

    // Nodes 0 and 1 publish their deals normally.
    let mut msgs = Vec::new();
    for node in &nodes[..2] {
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
        msgs.extend(result.result_msgs);
    }

    // Node 2 receives a corrupted commitment and fails its deal step; the
    // reply carries the deal error event instead.
    commits.participants[0] = DkgCommitEntry {
        participant_id: 0,
        username: nodes[0].username.clone(),
        commit: b"garbage".to_vec(),
    };
    let result = run_operation(
        &nodes[2],
        dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
        &commits,
        dkg_id,
        true,
    );
    assert_eq!(
        result.event,
        Some(dkg_proposal::EVENT_DKG_DEAL_CONFIRM_ERROR)
    );
    msgs.extend(result.result_msgs);

    let _ = feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_DEALS_CANCELED_BY_ERROR,
    );

    // No keyring may exist for a canceled round.
    for node in &nodes {
        assert!(!node
            .machine
            .store()
            .has_keyring(dkg_id)
            .expect("keystore lookup"));
    }
}

#[test]
fn dkg_round_cancels_on_timeout() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-dkg-timeout";

    let dump = enroll(&nodes, dkg_id, 2);
    let (_, dump) = apply_event(
        &dump,
        &dkg_proposal::EVENT_DKG_INIT_PROCESS,
        &FsmRequest::Default(crate::machines::requests::DefaultRequest { created_at: t0() }),
    )
    .expect("dkg init");

    let mut instance = FsmInstance::from_dump(&dump).expect("restore");
    let (response, _) = instance
        .tick(t0() + Duration::hours(25))
        .expect("tick past deadline");
    assert_eq!(
        response.state,
        dkg_proposal::STATE_DKG_COMMITS_CANCELED_BY_TIMEOUT
    );
}

#[test]
fn signing_cancels_when_declines_exceed_tolerance() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-signing-decline";

    let dkg = run_dkg(&nodes, dkg_id, 2);
    let (_, dump) = apply_event(
        &dkg.dump,
        &signing_proposal::EVENT_SIGNING_INIT,
        &FsmRequest::Default(crate::machines::requests::DefaultRequest { created_at: t0() }),
    )
    .expect("signing init");

    let request = FsmRequest::SigningStart(crate::machines::requests::SigningStartRequest {
        batch_id: "batch-declined".to_owned(),
        participant_id: 0,
        src_payload: vec![SigningMessage {
            signing_id: "msg-1".to_owned(),
            payload: b"hello".to_vec(),
        }],
        created_at: t0(),
    });
    let (_, dump) = apply_event(&dump, &signing_proposal::EVENT_SIGNING_START, &request)
        .expect("signing start");

    // N - T = 1, so the first decline is tolerated and the second cancels.
    let request = FsmRequest::SigningParticipant(SigningParticipantRequest {
        batch_id: "batch-declined".to_owned(),
        participant_id: 1,
        created_at: t0(),
    });
    let (response, dump) =
        apply_event(&dump, &signing_proposal::EVENT_DECLINE_SIGNING, &request)
            .expect("first decline");
    assert_eq!(
        response.state,
        signing_proposal::STATE_SIGNING_AWAIT_CONFIRMATIONS
    );

    let request = FsmRequest::SigningParticipant(SigningParticipantRequest {
        batch_id: "batch-declined".to_owned(),
        participant_id: 2,
        created_at: t0(),
    });
    let (response, _) =
        apply_event(&dump, &signing_proposal::EVENT_DECLINE_SIGNING, &request)
            .expect("second decline");
    assert_eq!(
        response.state,
        signing_proposal::STATE_SIGNING_CONFIRMATIONS_CANCELED_BY_PARTICIPANT
    );
}

#[test]
fn two_of_two_quorum_signs() {
    // Threshold edge case T = N.
    let nodes = spawn_nodes(2);
    let dkg_id = "round-two-of-two";

    let dkg = run_dkg(&nodes, dkg_id, 2);
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"edge".to_vec(),
    }];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-edge", batch);

    let result = run_operation(
        &nodes[0],
        signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
        &signing.process,
        dkg_id,
        false,
    );
    let reconstructed: Vec<crate::types::ReconstructedSignature> =
        serde_json::from_slice(&result.result_msgs[0].data).expect("decode signatures");
    nodes[0]
        .machine
        .verify_sign(b"edge", &reconstructed[0].signature, dkg_id)
        .expect("signature must verify");
}

#[test]
fn one_of_two_quorum_signs() {
    // Threshold edge case T = 1: a single partial signature recovers the
    // group signature.
    let nodes = spawn_nodes(2);
    let dkg_id = "round-one-of-two";

    let dkg = run_dkg(&nodes, dkg_id, 1);
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"solo".to_vec(),
    }];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-solo", batch);

    let result = run_operation(
        &nodes[1],
        signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
        &signing.process,
        dkg_id,
        false,
    );
    let reconstructed: Vec<crate::types::ReconstructedSignature> =
        serde_json::from_slice(&result.result_msgs[0].data).expect("decode signatures");
    nodes[1]
        .machine
        .verify_sign(b"solo", &reconstructed[0].signature, dkg_id)
        .expect("signature must verify");
}

#[test]
fn reconstruction_fails_below_threshold() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-below-threshold";

    let dkg = run_dkg(&nodes, dkg_id, 2);
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"hello".to_vec(),
    }];
    let mut signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-thin", batch);

    // Strip the collected contributions down to a single participant; the
    // reconstruction handler must reply with the failure event.
    signing.process.participants.truncate(1);
    let result = run_operation(
        &nodes[0],
        signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
        &signing.process,
        dkg_id,
        false,
    );
    assert_eq!(
        result.event,
        Some(crate::types::EVENT_SIGNATURE_RECONSTRUCTION_FAILED)
    );
}

#[test]
fn dropped_sensitive_data_blocks_handlers() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-drop";

    let dkg = run_dkg(&nodes, dkg_id, 2);
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"hello".to_vec(),
    }];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-drop", batch);

    nodes[0].machine.drop_sensitive_data();
    assert!(nodes[0].machine.sensitive_data_removed());

    let operation = crate::types::Operation::new(
        dkg_id,
        serde_json::to_vec(&signing.invitations).expect("payload"),
        signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        t0(),
    );
    let err = nodes[0]
        .machine
        .process_operation(operation, false)
        .unwrap_err();
    assert!(matches!(err, crate::EngineError::SensitiveDataCleared));
}

#[test]
fn late_commit_message_is_rejected() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-late-commit";

    let mut dump = enroll(&nodes, dkg_id, 2);
    let (response, new_dump) = apply_event(
        &dump,
        &dkg_proposal::EVENT_DKG_INIT_PROCESS,
        &FsmRequest::Default(crate::machines::requests::DefaultRequest { created_at: t0() }),
    )
    .expect("dkg init");
    dump = new_dump;
    let Some(FsmResponse::DkgPubKeys(pub_keys)) = response.data else {
        panic!("expected a pub keys response");
    };

    let mut msgs = Vec::new();
    for node in &nodes {
        let result = run_operation(
            node,
            dkg_proposal::STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS,
            &pub_keys,
            dkg_id,
            false,
        );
        msgs.extend(result.result_msgs);
    }
    feed_until(
        &mut dump,
        &msgs,
        &dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS,
    );

    // Redelivery of a commit after the round advanced fails with no state
    // change.
    let err = feed(&dump, &msgs[0]).unwrap_err();
    assert!(err.message.contains("cannot execute event"));
}
