//! End-to-end quorum runs: enrollment, DKG, signing, reconstruction.

use uuid::Uuid;

use crate::machines::payload::SigningMessage;
use crate::machines::requests::{FsmRequest, SigningParticipantRequest};
use crate::machines::signing_proposal;
use crate::types::{ReconstructedSignature, EVENT_SIGNATURE_RECONSTRUCTED};

use super::helpers::{apply_event, run_dkg, run_operation, run_signing, spawn_nodes, t0};

#[test]
fn three_of_two_happy_path() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-happy";

    let dkg = run_dkg(&nodes, dkg_id, 2);

    let batch_id = Uuid::new_v4().to_string();
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"hello".to_vec(),
    }];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, &batch_id, batch);

    // Reconstruction happens on any single machine.
    let result = run_operation(
        &nodes[0],
        signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
        &signing.process,
        dkg_id,
        false,
    );
    assert_eq!(result.event, Some(EVENT_SIGNATURE_RECONSTRUCTED));
    assert_eq!(result.result_msgs.len(), 1);

    let reconstructed: Vec<ReconstructedSignature> =
        serde_json::from_slice(&result.result_msgs[0].data).expect("decode signatures");
    assert_eq!(reconstructed.len(), 1);
    assert_eq!(reconstructed[0].signing_id, "msg-1");
    assert_eq!(reconstructed[0].src_payload, b"hello".to_vec());

    // The recovered signature verifies on every machine against the same
    // group public key.
    for node in &nodes {
        node.machine
            .verify_sign(b"hello", &reconstructed[0].signature, dkg_id)
            .expect("signature must verify");
    }

    // A tampered message must not verify.
    assert!(nodes[0]
        .machine
        .verify_sign(b"hello!", &reconstructed[0].signature, dkg_id)
        .is_err());
}

#[test]
fn partial_signatures_are_deterministic() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-deterministic";

    let dkg = run_dkg(&nodes, dkg_id, 2);
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"hello".to_vec(),
    }];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-1", batch);

    // The same machine signing the same batch twice produces byte-equal
    // partial signatures.
    let first = run_operation(
        &nodes[1],
        signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        &signing.invitations,
        dkg_id,
        false,
    );
    let second = run_operation(
        &nodes[1],
        signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS,
        &signing.invitations,
        dkg_id,
        false,
    );
    assert_eq!(first.result_msgs[0].data, second.result_msgs[0].data);
}

#[test]
fn stale_event_is_rejected_without_state_change() {
    let nodes = spawn_nodes(3);
    let dkg_id = "round-stale";

    let dkg = run_dkg(&nodes, dkg_id, 2);
    let batch = vec![SigningMessage {
        signing_id: "msg-1".to_owned(),
        payload: b"hello".to_vec(),
    }];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-1", batch);

    // A late confirmation against the already-collected batch fails loudly.
    let request = FsmRequest::SigningParticipant(SigningParticipantRequest {
        batch_id: "batch-1".to_owned(),
        participant_id: 2,
        created_at: t0(),
    });
    let err = apply_event(
        &signing.dump,
        &signing_proposal::EVENT_CONFIRM_SIGNING,
        &request,
    )
    .unwrap_err();
    assert!(err.message.contains("cannot execute event"));

    let instance = crate::machines::FsmInstance::from_dump(&signing.dump).expect("restore");
    assert_eq!(
        instance.state(),
        signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED
    );
}

#[test]
fn five_of_three_batch_signing() {
    let nodes = spawn_nodes(5);
    let dkg_id = "round-batch";

    let dkg = run_dkg(&nodes, dkg_id, 3);
    let batch = vec![
        SigningMessage {
            signing_id: "msg-a".to_owned(),
            payload: b"a".to_vec(),
        },
        SigningMessage {
            signing_id: "msg-b".to_owned(),
            payload: b"b".to_vec(),
        },
    ];
    let signing = run_signing(&nodes, dkg_id, dkg.dump, "batch-ab", batch);

    let result = run_operation(
        &nodes[2],
        signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED,
        &signing.process,
        dkg_id,
        false,
    );
    assert_eq!(result.event, Some(EVENT_SIGNATURE_RECONSTRUCTED));

    let reconstructed: Vec<ReconstructedSignature> =
        serde_json::from_slice(&result.result_msgs[0].data).expect("decode signatures");
    assert_eq!(reconstructed.len(), 2);

    for signature in &reconstructed {
        for node in &nodes {
            node.machine
                .verify_sign(&signature.src_payload, &signature.signature, dkg_id)
                .expect("signature must verify");
        }
    }

    // The quorum can restart for the next batch.
    let request = FsmRequest::Default(crate::machines::requests::DefaultRequest {
        created_at: t0(),
    });
    let (response, _) = apply_event(
        &signing.dump,
        &signing_proposal::EVENT_SIGNING_RESTART,
        &request,
    )
    .expect("signing restart");
    assert_eq!(response.state, signing_proposal::STATE_SIGNING_IDLE);
}
