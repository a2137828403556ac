//! Wire types exchanged between the node and the air-gapped machine, plus
//! the transport contract the node implements.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::fsm::{Event, State};
use crate::machines::signing_proposal;

/// Pseudo-state tag for the round re-initialization operation.
pub const STATE_REINIT_DKG: State = State::new("reinit_dkg");

pub const EVENT_SIGNATURE_RECONSTRUCTED: Event = Event::new("event_signature_reconstructed");
pub const EVENT_SIGNATURE_RECONSTRUCTION_FAILED: Event =
    Event::new("event_signature_reconstruction_failed");
pub const EVENT_REINIT_DKG_COMPLETED: Event = Event::new("event_reinit_dkg_completed");

/// One entry of the totally-ordered broadcast log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub dkg_round_id: String,
    pub offset: u64,
    pub event: Event,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
    pub sender_addr: String,
    /// Empty means broadcast.
    pub recipient_addr: String,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.recipient_addr.is_empty()
    }
}

/// The message-bus adapter the node supplies: totally ordered,
/// at-least-once, idempotent per offset.
pub trait Storage {
    fn send(&mut self, messages: &[Message]) -> Result<(), EngineError>;
    fn get_messages(&self, offset: u64) -> Result<Vec<Message>, EngineError>;
    fn ignore_messages(&mut self, ids: &[String], use_offset: bool) -> Result<(), EngineError>;
    fn unignore_messages(&mut self);
    fn close(&mut self) -> Result<(), EngineError>;
}

/// The request-unit handed over the air gap: a state tag plus the payload
/// the machine in that state needs, echoed back enriched with reply
/// messages and the produced event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: State,
    pub payload: Vec<u8>,
    pub result_msgs: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub dkg_identifier: String,
    pub to: String,
    pub event: Option<Event>,
}

impl Operation {
    pub fn new(
        dkg_round_id: &str,
        payload: Vec<u8>,
        state: State,
        created_at: DateTime<Utc>,
    ) -> Self {
        let tagged = format!("{}_{}", dkg_round_id, base64::encode(&payload));
        let id = hex::encode(Md5::digest(tagged.as_bytes()));
        Self {
            id,
            op_type: state,
            payload,
            result_msgs: Vec::new(),
            created_at,
            dkg_identifier: dkg_round_id.to_owned(),
            to: String::new(),
            event: None,
        }
    }

    pub fn filename(&self) -> String {
        format!("{}_{}", self.id, self.op_type)
    }

    /// Match a returned result file against the operation it was produced
    /// from.
    pub fn check(&self, other: &Operation) -> Result<(), EngineError> {
        if self.id != other.id {
            return Err(EngineError::InvalidOperationType(format!(
                "operation id mismatch: {} != {}",
                self.id, other.id
            )));
        }
        if self.op_type != other.op_type {
            return Err(EngineError::InvalidOperationType(format!(
                "operation type mismatch: {} != {}",
                self.op_type, other.op_type
            )));
        }
        if self.payload != other.payload {
            return Err(EngineError::InvalidOperationType(
                "operation payload mismatch".to_owned(),
            ));
        }
        Ok(())
    }

    /// Signing-state operations are transient and stay out of the
    /// operation log.
    pub fn is_signing_state(&self) -> bool {
        self.op_type == signing_proposal::STATE_SIGNING_IDLE
            || self.op_type == signing_proposal::STATE_SIGNING_AWAIT_CONFIRMATIONS
            || self.op_type == signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS
            || self.op_type == signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED
    }
}

/// A recovered group signature for one message of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedSignature {
    pub signing_id: String,
    pub src_payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub dkg_round_id: String,
}
