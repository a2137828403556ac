//! Error types for the state-machine kernel.

use thiserror::Error;

use super::{Event, State};

/// Severity of a runtime FSM error.
///
/// `Warn` lets the triggering transition proceed; `Error` and `Fatal` abort
/// it with no state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    Warn,
    Error,
    Fatal,
}

/// Runtime error produced while executing a transition or a callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FsmError {
    pub level: ErrorLevel,
    pub message: String,
}

impl FsmError {
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: ErrorLevel::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ErrorLevel::Error,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            level: ErrorLevel::Fatal,
            message: message.into(),
        }
    }

    pub fn is_warn(&self) -> bool {
        self.level == ErrorLevel::Warn
    }
}

/// Programmer/config errors detected while assembling a machine.
///
/// These correspond to the fail-fast panics of classic FSM builders; library
/// users should hit them once, at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("machine name cannot be empty")]
    EmptyMachineName,
    #[error("initial state cannot be empty")]
    EmptyInitialState,
    #[error("cannot build a machine with no events")]
    NoEvents,
    #[error("cannot register an event with an empty name")]
    EmptyEventName,
    #[error("event \"{0}\" destination cannot be empty")]
    EmptyDstState(Event),
    #[error("duplicate event \"{0}\"")]
    DuplicateEvent(Event),
    #[error("\"{0}\" cannot be used as a source state")]
    DoneAsSource(State),
    #[error("duplicate transition for source \"{state}\" and event \"{event}\"")]
    DuplicateTransition { state: State, event: Event },
    #[error("auto event \"{event}\" already registered for state \"{state}\"")]
    DuplicateAutoTransition { state: State, event: Event },
    #[error("auto event \"{0}\" has no run mode")]
    AutoRunModeNotSet(Event),
    #[error("event \"{0}\" must have at least one source state")]
    NoSourceStates(Event),
    #[error("machine must contain at least two states")]
    TooFewStates,
    #[error("machine must contain at least one final state")]
    NoFinalStates,
    #[error("callback registered for unknown event \"{0}\"")]
    UnknownCallbackEvent(Event),
    #[error("cannot set state \"{state}\": unknown to machine \"{machine}\"")]
    UnknownState { machine: String, state: State },
}
