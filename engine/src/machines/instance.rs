//! One round's running machine plus its serializable dump.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::fsm::{Event, FsmError, Response, State};

use super::payload::RoundPayload;
use super::requests::{FsmRequest, TickRequest};
use super::responses::FsmResponse;
use super::{MachineFsm, MachineKind};

/// Serializable machine snapshot: round id, current state, and the whole
/// round payload. Written after every accepted transition, reloaded on
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmDump {
    pub transaction_id: String,
    pub state: State,
    pub payload: RoundPayload,
}

impl FsmDump {
    pub fn marshal(&self) -> Result<Vec<u8>, FsmError> {
        serde_json::to_vec(self)
            .map_err(|err| FsmError::error(format!("cannot marshal machine dump: {err}")))
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, FsmError> {
        serde_json::from_slice(data)
            .map_err(|err| FsmError::error(format!("cannot read machine dump: {err}")))
    }
}

/// Wraps the machine selected for the dump's state and serializes
/// transitions against it.
pub struct FsmInstance {
    machine: MachineFsm,
    payload: Arc<Mutex<RoundPayload>>,
    transaction_id: String,
}

impl FsmInstance {
    /// A fresh round, rooted at the roll-call machine in the global idle
    /// state.
    pub fn create(dkg_id: &str) -> Result<Self, FsmError> {
        let dkg_id = dkg_id.trim();
        if dkg_id.is_empty() {
            return Err(FsmError::fatal("empty dkg round id"));
        }

        let payload = Arc::new(Mutex::new(RoundPayload::new(dkg_id)));
        let machine = MachineKind::entry_point()
            .build(Arc::clone(&payload))
            .map_err(|err| FsmError::fatal(err.to_string()))?;

        Ok(Self {
            machine,
            payload,
            transaction_id: dkg_id.to_owned(),
        })
    }

    /// Restore an instance whose active machine is the one owning the
    /// dumped state.
    pub fn from_dump(data: &[u8]) -> Result<Self, FsmError> {
        if data.len() < 2 {
            return Err(FsmError::error("machine dump is empty"));
        }
        let dump = FsmDump::unmarshal(data)?;

        let kind = MachineKind::by_state(&dump.state)?;
        let transaction_id = dump.transaction_id;
        let payload = Arc::new(Mutex::new(dump.payload));
        let machine = kind
            .build(Arc::clone(&payload))
            .map_err(|err| FsmError::fatal(err.to_string()))?
            .copy_with_state(dump.state)
            .map_err(|err| FsmError::fatal(err.to_string()))?;

        Ok(Self {
            machine,
            payload,
            transaction_id,
        })
    }

    /// Run one transition; on success the refreshed dump is returned along
    /// with the machine response.
    pub fn apply(
        &mut self,
        event: &Event,
        request: &FsmRequest,
    ) -> Result<(Response<FsmResponse>, Vec<u8>), FsmError> {
        let response = self.machine.do_event(event, request)?;
        let dump = self.dump()?;
        Ok((response, dump))
    }

    /// Re-evaluate the current state's validator with the caller's clock.
    pub fn tick(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(Response<FsmResponse>, Vec<u8>), FsmError> {
        let response = self.machine.tick(&FsmRequest::Tick(TickRequest { now }))?;
        let dump = self.dump()?;
        Ok((response, dump))
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn id(&self) -> &str {
        &self.transaction_id
    }

    pub fn dump(&self) -> Result<Vec<u8>, FsmError> {
        let payload = self
            .payload
            .lock()
            .map_err(|_| FsmError::fatal("payload lock poisoned"))?;
        FsmDump {
            transaction_id: self.transaction_id.clone(),
            state: self.machine.state(),
            payload: payload.clone(),
        }
        .marshal()
    }

    pub fn pub_key_by_username(&self, username: &str) -> Result<Vec<u8>, FsmError> {
        let payload = self
            .payload
            .lock()
            .map_err(|_| FsmError::fatal("payload lock poisoned"))?;
        payload
            .pub_key_by_username(username)
            .map(|key| key.to_vec())
            .ok_or_else(|| FsmError::error(format!("unknown username: {username}")))
    }

    pub fn id_by_username(&self, username: &str) -> Result<usize, FsmError> {
        let payload = self
            .payload
            .lock()
            .map_err(|_| FsmError::fatal("payload lock poisoned"))?;
        payload
            .id_by_username(username)
            .ok_or_else(|| FsmError::error(format!("unknown username: {username}")))
    }
}
