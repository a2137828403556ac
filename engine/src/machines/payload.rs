//! The dumped machine state shared by the three protocol machines.
//!
//! A round owns exactly one [`RoundPayload`] with three optional
//! sub-payloads; each machine mutates only its own sub-payload under the
//! instance's payload mutex. The whole structure is serializable so a dump
//! can be persisted after every accepted transition and restored on restart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message of a signing batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningMessage {
    pub signing_id: String,
    pub payload: Vec<u8>,
}

/// A participant's partial signature over one message of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub signing_id: String,
    pub sign: Vec<u8>,
}

/// A VSS deal encrypted to one recipient's long-term public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDeal {
    pub recipient_id: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureProposalStatus {
    AwaitConfirmation,
    Confirmed,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgStatus {
    CommitAwaitConfirmation,
    CommitConfirmed,
    CommitError,
    DealAwaitConfirmation,
    DealConfirmed,
    DealError,
    ResponseAwaitConfirmation,
    ResponseConfirmed,
    ResponseError,
    MasterKeyAwaitConfirmation,
    MasterKeyConfirmed,
    MasterKeyError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningStatus {
    AwaitConfirmation,
    Confirmed,
    Declined,
    AwaitPartialSign,
    PartialSignConfirmed,
    Error,
}

impl SignatureProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureProposalStatus::AwaitConfirmation => "await_confirmation",
            SignatureProposalStatus::Confirmed => "confirmed",
            SignatureProposalStatus::Declined => "declined",
        }
    }
}

impl SigningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningStatus::AwaitConfirmation => "await_confirmation",
            SigningStatus::Confirmed => "confirmed",
            SigningStatus::Declined => "declined",
            SigningStatus::AwaitPartialSign => "await_partial_sign",
            SigningStatus::PartialSignConfirmed => "partial_sign_confirmed",
            SigningStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureProposalParticipant {
    pub username: String,
    pub pub_key: Vec<u8>,
    pub status: SignatureProposalStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgProposalParticipant {
    pub username: String,
    pub pub_key: Vec<u8>,
    pub status: DkgStatus,
    /// Broadcast VSS commitment bytes.
    pub commit: Vec<u8>,
    /// Deals published by this participant, one per other participant.
    pub deals: Vec<EncryptedDeal>,
    /// Serialized verification responses for the deals this participant
    /// received.
    pub responses: Vec<u8>,
    /// The group public key this participant reconstructed.
    pub master_key: Vec<u8>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningProposalParticipant {
    pub username: String,
    pub status: SigningStatus,
    pub partial_signs: Vec<PartialSignature>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Participant roll-call sub-payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfirmation {
    pub quorum: BTreeMap<usize, SignatureProposalParticipant>,
    pub threshold: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// DKG pipeline sub-payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgConfirmation {
    pub quorum: BTreeMap<usize, DkgProposalParticipant>,
    pub threshold: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Signing batch sub-payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfirmation {
    pub batch_id: String,
    pub initiator_id: usize,
    pub src_payload: Vec<SigningMessage>,
    pub quorum: BTreeMap<usize, SigningProposalParticipant>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignatureConfirmation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl DkgConfirmation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl SigningConfirmation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Everything one DKG round's machines know, in one owned structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundPayload {
    pub dkg_id: String,
    pub signature_proposal: Option<SignatureConfirmation>,
    pub dkg_proposal: Option<DkgConfirmation>,
    pub signing_proposal: Option<SigningConfirmation>,
}

impl RoundPayload {
    pub fn new(dkg_id: impl Into<String>) -> Self {
        Self {
            dkg_id: dkg_id.into(),
            signature_proposal: None,
            dkg_proposal: None,
            signing_proposal: None,
        }
    }

    /// The signing threshold fixed at enrollment for this round.
    pub fn threshold(&self) -> usize {
        if let Some(dkg) = &self.dkg_proposal {
            return dkg.threshold;
        }
        self.signature_proposal
            .as_ref()
            .map(|sig| sig.threshold)
            .unwrap_or(0)
    }

    pub fn pub_key_by_username(&self, username: &str) -> Option<&[u8]> {
        let sig = self.signature_proposal.as_ref()?;
        sig.quorum
            .values()
            .find(|p| p.username == username)
            .map(|p| p.pub_key.as_slice())
    }

    pub fn id_by_username(&self, username: &str) -> Option<usize> {
        let sig = self.signature_proposal.as_ref()?;
        sig.quorum
            .iter()
            .find(|(_, p)| p.username == username)
            .map(|(id, _)| *id)
    }
}
