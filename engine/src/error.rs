//! Centralized engine error types.

use thiserror::Error;

use crate::fsm::FsmError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation carries a state tag no handler is registered for.
    #[error("invalid operation type: {0}")]
    InvalidOperationType(String),
    /// No DKG instance or keyring for the given round identifier.
    #[error("unknown dkg round: {0}")]
    UnknownDkgRound(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("vss verification failed: {0}")]
    VssVerificationFailed(String),
    #[error("threshold not met: required {required}, got {got}")]
    ThresholdNotMet { required: usize, got: usize },
    #[error("keystore i/o: {0}")]
    KeystoreIo(String),
    /// Sensitive material was dropped (or never supplied); handlers refuse
    /// to run until the machine is re-keyed.
    #[error("sensitive data cleared")]
    SensitiveDataCleared,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("cryptographic error: {0}")]
    Crypto(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fsm error: {0}")]
    Fsm(#[from] FsmError),
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::KeystoreIo(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
