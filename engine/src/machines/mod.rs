//! The three protocol machines and their shared infrastructure.
//!
//! A DKG round is driven by one machine at a time: participant roll-call
//! ([`signature_proposal`]), the four-round key generation pipeline
//! ([`dkg_proposal`]), and batch signing ([`signing_proposal`]). All three
//! read and write one [`RoundPayload`] guarded by the instance's payload
//! mutex; [`MachineKind`] routes a dumped state to the machine that can
//! continue from it.

pub mod dkg_proposal;
pub mod instance;
pub mod payload;
pub mod requests;
pub mod responses;
pub mod signature_proposal;
pub mod signing_proposal;

use std::sync::{Arc, Mutex};

pub use instance::{FsmDump, FsmInstance};
pub use payload::RoundPayload;
pub use requests::FsmRequest;
pub use responses::FsmResponse;

use crate::fsm::{
    BuildError, Callback, CallbackResult, Event, Fsm, FsmError, State,
};

pub type MachineFsm = Fsm<FsmRequest, FsmResponse>;

pub(crate) type ActionResult = Result<CallbackResult<FsmResponse>, FsmError>;

type Action = fn(&mut RoundPayload, &Event, &FsmRequest) -> ActionResult;

/// Wrap a plain action function into a kernel callback holding the payload
/// mutex for the duration of the action.
pub(crate) fn bind(
    payload: &Arc<Mutex<RoundPayload>>,
    action: Action,
) -> Callback<FsmRequest, FsmResponse> {
    let payload = Arc::clone(payload);
    Arc::new(move |event, request| {
        let mut guard = payload
            .lock()
            .map_err(|_| FsmError::fatal("payload lock poisoned"))?;
        action(&mut guard, event, request)
    })
}

/// Tagged sum over the protocol machines; replaces dynamic dispatch with a
/// lookup table keyed by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    SignatureProposal,
    DkgProposal,
    SigningProposal,
}

impl MachineKind {
    /// The machine a fresh round starts in.
    pub fn entry_point() -> Self {
        MachineKind::SignatureProposal
    }

    const ALL: [MachineKind; 3] = [
        MachineKind::SignatureProposal,
        MachineKind::DkgProposal,
        MachineKind::SigningProposal,
    ];

    fn source_states(&self) -> &'static [State] {
        match self {
            MachineKind::SignatureProposal => signature_proposal::SOURCE_STATES,
            MachineKind::DkgProposal => dkg_proposal::SOURCE_STATES,
            MachineKind::SigningProposal => signing_proposal::SOURCE_STATES,
        }
    }

    fn all_states(&self) -> &'static [State] {
        match self {
            MachineKind::SignatureProposal => signature_proposal::ALL_STATES,
            MachineKind::DkgProposal => dkg_proposal::ALL_STATES,
            MachineKind::SigningProposal => signing_proposal::ALL_STATES,
        }
    }

    /// Find the machine able to continue from `state`: first the one that
    /// can transition out of it, otherwise the one that owns it as a
    /// terminal state.
    pub fn by_state(state: &State) -> Result<Self, FsmError> {
        for kind in Self::ALL {
            if kind.source_states().contains(state) {
                return Ok(kind);
            }
        }
        for kind in Self::ALL {
            if kind.all_states().contains(state) {
                return Ok(kind);
            }
        }
        Err(FsmError::error(format!(
            "no machine registered for state \"{state}\""
        )))
    }

    pub fn build(
        &self,
        payload: Arc<Mutex<RoundPayload>>,
    ) -> Result<MachineFsm, BuildError> {
        match self {
            MachineKind::SignatureProposal => signature_proposal::new(payload),
            MachineKind::DkgProposal => dkg_proposal::new(payload),
            MachineKind::SigningProposal => signing_proposal::new(payload),
        }
    }
}
