//! Typed response payloads produced by machine callbacks.
//!
//! A response is what the node serializes into an operation payload for the
//! air-gapped machine (or shows to operators), so every struct here is a
//! stable JSON shape.

use serde::{Deserialize, Serialize};

use super::payload::{EncryptedDeal, PartialSignature, SigningMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureProposalEntry {
    pub participant_id: usize,
    pub username: String,
    pub status: String,
}

/// Roll-call invitations (on `init_proposal`) and the final confirmation
/// summary (on proposal collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureProposalParticipantsResponse {
    pub threshold: usize,
    pub participants: Vec<SignatureProposalEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgPubKeyEntry {
    pub participant_id: usize,
    pub username: String,
    pub dkg_pub_key: Vec<u8>,
}

/// Payload of the commits-round operation: everyone's long-term public key
/// plus the round threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgPubKeysParticipantResponse {
    pub threshold: usize,
    pub participants: Vec<DkgPubKeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgCommitEntry {
    pub participant_id: usize,
    pub username: String,
    pub commit: Vec<u8>,
}

/// Payload of the deals-round operation: all broadcast commitments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgCommitsParticipantResponse {
    pub participants: Vec<DkgCommitEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgDealEntry {
    pub participant_id: usize,
    pub username: String,
    pub deals: Vec<EncryptedDeal>,
}

/// Payload of the responses-round operation: every participant's encrypted
/// deals; each machine picks the ones addressed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgDealsParticipantResponse {
    pub participants: Vec<DkgDealEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgResponseEntry {
    pub participant_id: usize,
    pub username: String,
    pub responses: Vec<u8>,
}

/// Payload of the master-key-round operation: all verification responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgResponsesParticipantResponse {
    pub participants: Vec<DkgResponseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningParticipantEntry {
    pub participant_id: usize,
    pub username: String,
    pub status: String,
}

/// Invitations broadcast when a signing batch is proposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningParticipantInvitationsResponse {
    pub batch_id: String,
    pub initiator_id: usize,
    pub src_payload: Vec<SigningMessage>,
    pub participants: Vec<SigningParticipantEntry>,
}

/// Payload of the partial-signs operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningPartialSignsInvitationsResponse {
    pub batch_id: String,
    pub initiator_id: usize,
    pub src_payload: Vec<SigningMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningProcessEntry {
    pub participant_id: usize,
    pub username: String,
    pub partial_signs: Vec<PartialSignature>,
}

/// Payload of the reconstruction operation: every collected partial
/// signature, grouped by participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningProcessParticipantResponse {
    pub batch_id: String,
    pub src_payload: Vec<SigningMessage>,
    pub participants: Vec<SigningProcessEntry>,
}

/// The tagged sum of every payload a machine callback can hand back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FsmResponse {
    SignatureProposalParticipants(SignatureProposalParticipantsResponse),
    DkgPubKeys(DkgPubKeysParticipantResponse),
    DkgCommits(DkgCommitsParticipantResponse),
    DkgDeals(DkgDealsParticipantResponse),
    DkgResponses(DkgResponsesParticipantResponse),
    SigningInvitations(SigningParticipantInvitationsResponse),
    SigningPartialSignsInvitations(SigningPartialSignsInvitationsResponse),
    SigningProcess(SigningProcessParticipantResponse),
}
