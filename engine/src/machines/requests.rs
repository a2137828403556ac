//! Per-event typed request structs.
//!
//! Every bus message decodes into exactly one of these before any callback
//! runs; actions receive the already-typed value through [`FsmRequest`] and
//! reject a mismatched variant instead of downcasting at runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::{EncryptedDeal, PartialSignature, SigningMessage};
use super::{dkg_proposal, signature_proposal, signing_proposal};
use crate::fsm::{Event, FsmError};

/// Events that carry nothing but their timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultRequest {
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalParticipantEntry {
    pub username: String,
    pub pub_key: Vec<u8>,
}

/// `init_proposal` arguments: the quorum roster and the signing threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureProposalParticipantsListRequest {
    pub participants: Vec<ProposalParticipantEntry>,
    pub signing_threshold: usize,
    pub created_at: DateTime<Utc>,
}

impl SignatureProposalParticipantsListRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        let n = self.participants.len();
        if n < 2 {
            return Err(FsmError::error("a quorum requires at least two participants"));
        }
        if self.signing_threshold < 1 || self.signing_threshold > n {
            return Err(FsmError::error(format!(
                "signing threshold must be within [1, {}], got {}",
                n, self.signing_threshold
            )));
        }
        for entry in &self.participants {
            if entry.username.trim().is_empty() {
                return Err(FsmError::error("participant username cannot be empty"));
            }
            if entry.pub_key.is_empty() {
                return Err(FsmError::error("participant public key cannot be empty"));
            }
        }
        let mut usernames: Vec<&str> =
            self.participants.iter().map(|p| p.username.as_str()).collect();
        usernames.sort_unstable();
        usernames.dedup();
        if usernames.len() != n {
            return Err(FsmError::error("participant usernames must be unique"));
        }
        Ok(())
    }
}

/// `confirm_proposal` / `decline_proposal` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureProposalParticipantRequest {
    pub participant_id: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgCommitConfirmationRequest {
    pub participant_id: usize,
    pub commit: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl DkgCommitConfirmationRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.commit.is_empty() {
            return Err(FsmError::error("commit cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgDealConfirmationRequest {
    pub participant_id: usize,
    pub deals: Vec<EncryptedDeal>,
    pub created_at: DateTime<Utc>,
}

impl DkgDealConfirmationRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.deals.is_empty() {
            return Err(FsmError::error("deals cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgResponseConfirmationRequest {
    pub participant_id: usize,
    pub responses: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl DkgResponseConfirmationRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.responses.is_empty() {
            return Err(FsmError::error("responses cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgMasterKeyConfirmationRequest {
    pub participant_id: usize,
    pub master_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl DkgMasterKeyConfirmationRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.master_key.is_empty() {
            return Err(FsmError::error("master key cannot be empty"));
        }
        Ok(())
    }
}

/// Error description embedded in an error-event request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub description: String,
}

impl ErrorDetails {
    pub fn new(err: impl std::fmt::Display) -> Self {
        Self {
            description: err.to_string(),
        }
    }
}

/// Shared shape for all per-state error events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationErrorRequest {
    pub participant_id: usize,
    pub error: ErrorDetails,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningStartRequest {
    pub batch_id: String,
    pub participant_id: usize,
    pub src_payload: Vec<SigningMessage>,
    pub created_at: DateTime<Utc>,
}

impl SigningStartRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.batch_id.trim().is_empty() {
            return Err(FsmError::error("batch id cannot be empty"));
        }
        if self.src_payload.is_empty() {
            return Err(FsmError::error("signing batch cannot be empty"));
        }
        Ok(())
    }
}

/// `confirm_signing` / `decline_signing` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningParticipantRequest {
    pub batch_id: String,
    pub participant_id: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningPartialSignsRequest {
    pub batch_id: String,
    pub participant_id: usize,
    pub partial_signs: Vec<PartialSignature>,
    pub created_at: DateTime<Utc>,
}

impl SigningPartialSignsRequest {
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.partial_signs.is_empty() {
            return Err(FsmError::error("partial signs cannot be empty"));
        }
        if self.partial_signs.iter().any(|p| p.sign.is_empty()) {
            return Err(FsmError::error("partial sign cannot be empty"));
        }
        Ok(())
    }
}

/// Caller-supplied clock for validator re-evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRequest {
    pub now: DateTime<Utc>,
}

/// The tagged sum of every argument shape a protocol machine accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FsmRequest {
    Default(DefaultRequest),
    ProposalInit(SignatureProposalParticipantsListRequest),
    ProposalParticipant(SignatureProposalParticipantRequest),
    DkgCommitConfirmation(DkgCommitConfirmationRequest),
    DkgDealConfirmation(DkgDealConfirmationRequest),
    DkgResponseConfirmation(DkgResponseConfirmationRequest),
    DkgMasterKeyConfirmation(DkgMasterKeyConfirmationRequest),
    ConfirmationError(ConfirmationErrorRequest),
    SigningStart(SigningStartRequest),
    SigningParticipant(SigningParticipantRequest),
    SigningPartialSigns(SigningPartialSignsRequest),
    Tick(TickRequest),
}

impl FsmRequest {
    /// The timestamp validators measure deadlines against.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            FsmRequest::Default(r) => r.created_at,
            FsmRequest::ProposalInit(r) => r.created_at,
            FsmRequest::ProposalParticipant(r) => r.created_at,
            FsmRequest::DkgCommitConfirmation(r) => r.created_at,
            FsmRequest::DkgDealConfirmation(r) => r.created_at,
            FsmRequest::DkgResponseConfirmation(r) => r.created_at,
            FsmRequest::DkgMasterKeyConfirmation(r) => r.created_at,
            FsmRequest::ConfirmationError(r) => r.created_at,
            FsmRequest::SigningStart(r) => r.created_at,
            FsmRequest::SigningParticipant(r) => r.created_at,
            FsmRequest::SigningPartialSigns(r) => r.created_at,
            FsmRequest::Tick(r) => r.now,
        }
    }

    /// Decode a bus message's JSON data into the typed request its event
    /// expects.
    pub fn from_message(event: &Event, data: &[u8]) -> Result<FsmRequest, FsmError> {
        let decode_err =
            |err: serde_json::Error| FsmError::error(format!("failed to decode request: {err}"));

        let request = match event {
            e if *e == signature_proposal::EVENT_INIT_PROPOSAL => {
                FsmRequest::ProposalInit(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == signature_proposal::EVENT_CONFIRM_PROPOSAL
                || *e == signature_proposal::EVENT_DECLINE_PROPOSAL =>
            {
                FsmRequest::ProposalParticipant(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == dkg_proposal::EVENT_DKG_INIT_PROCESS
                || *e == signing_proposal::EVENT_SIGNING_INIT
                || *e == signing_proposal::EVENT_SIGNING_RESTART =>
            {
                FsmRequest::Default(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == dkg_proposal::EVENT_DKG_COMMIT_CONFIRM_RECEIVED => {
                FsmRequest::DkgCommitConfirmation(
                    serde_json::from_slice(data).map_err(decode_err)?,
                )
            }
            e if *e == dkg_proposal::EVENT_DKG_DEAL_CONFIRM_RECEIVED => {
                FsmRequest::DkgDealConfirmation(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == dkg_proposal::EVENT_DKG_RESPONSE_CONFIRM_RECEIVED => {
                FsmRequest::DkgResponseConfirmation(
                    serde_json::from_slice(data).map_err(decode_err)?,
                )
            }
            e if *e == dkg_proposal::EVENT_DKG_MASTER_KEY_CONFIRM_RECEIVED => {
                FsmRequest::DkgMasterKeyConfirmation(
                    serde_json::from_slice(data).map_err(decode_err)?,
                )
            }
            e if *e == dkg_proposal::EVENT_DKG_COMMIT_CONFIRM_ERROR
                || *e == dkg_proposal::EVENT_DKG_DEAL_CONFIRM_ERROR
                || *e == dkg_proposal::EVENT_DKG_RESPONSE_CONFIRM_ERROR
                || *e == dkg_proposal::EVENT_DKG_MASTER_KEY_CONFIRM_ERROR
                || *e == signing_proposal::EVENT_SIGNING_PARTIAL_SIGN_ERROR =>
            {
                FsmRequest::ConfirmationError(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == signing_proposal::EVENT_SIGNING_START => {
                FsmRequest::SigningStart(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == signing_proposal::EVENT_CONFIRM_SIGNING
                || *e == signing_proposal::EVENT_DECLINE_SIGNING =>
            {
                FsmRequest::SigningParticipant(serde_json::from_slice(data).map_err(decode_err)?)
            }
            e if *e == signing_proposal::EVENT_SIGNING_PARTIAL_SIGN_RECEIVED => {
                FsmRequest::SigningPartialSigns(serde_json::from_slice(data).map_err(decode_err)?)
            }
            _ => return Err(FsmError::error(format!("invalid event: {event}"))),
        };

        Ok(request)
    }
}
