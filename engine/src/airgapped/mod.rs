//! The air-gapped machine.
//!
//! Consumes operations produced by the networked node, runs the matching
//! cryptographic step, and writes a reply file the node carries back over
//! the air gap. Never touches the network; everything sensitive lives in the
//! local keystore, keyrings encrypted at rest. One machine-level mutex
//! serializes operation processing, replay, and sensitive-data teardown.

mod bls;
mod dkg;
mod keystore;

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use blsttc::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub use bls::BlsKeyring;
pub use dkg::{DkgInstance, DkgParticipant, DealResponse};
pub use keystore::KeyStore;

use crate::error::EngineError;
use crate::fsm::{Event, State};
use crate::machines::payload::PartialSignature;
use crate::machines::requests::{
    ConfirmationErrorRequest, DkgCommitConfirmationRequest, DkgDealConfirmationRequest,
    DkgMasterKeyConfirmationRequest, DkgResponseConfirmationRequest, ErrorDetails,
    SigningPartialSignsRequest,
};
use crate::machines::responses::{
    DkgCommitsParticipantResponse, DkgDealsParticipantResponse, DkgPubKeysParticipantResponse,
    DkgResponsesParticipantResponse, SigningPartialSignsInvitationsResponse,
    SigningProcessParticipantResponse,
};
use crate::machines::{dkg_proposal, signature_proposal, signing_proposal};
use crate::types::{
    Message, Operation, ReconstructedSignature, EVENT_REINIT_DKG_COMPLETED,
    EVENT_SIGNATURE_RECONSTRUCTED, EVENT_SIGNATURE_RECONSTRUCTION_FAILED, STATE_REINIT_DKG,
};

/// Confirmation reply to a round re-initialization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinitDkgConfirmation {
    pub participant_id: usize,
    pub dkg_pub_key: Vec<u8>,
}

struct Inner {
    dkg_instances: HashMap<String, DkgInstance>,
    sec_key: Option<SecretKey>,
    pub_key: Option<PublicKey>,
    encryption_key: Option<Zeroizing<[u8; 32]>>,
    base_seed: Option<Zeroizing<Vec<u8>>>,
    cleared: bool,
}

impl Inner {
    fn base_seed(&self) -> Result<&[u8], EngineError> {
        self.base_seed
            .as_deref()
            .map(|seed| seed.as_slice())
            .ok_or(EngineError::SensitiveDataCleared)
    }

    fn sec_key(&self) -> Result<&SecretKey, EngineError> {
        self.sec_key
            .as_ref()
            .ok_or(EngineError::SensitiveDataCleared)
    }

    fn pub_key(&self) -> Result<&PublicKey, EngineError> {
        self.pub_key
            .as_ref()
            .ok_or(EngineError::SensitiveDataCleared)
    }

    fn encryption_key(&self) -> Result<&[u8; 32], EngineError> {
        self.encryption_key
            .as_deref()
            .ok_or(EngineError::SensitiveDataCleared)
    }
}

pub struct Machine {
    result_folder: PathBuf,
    store: KeyStore,
    inner: Mutex<Inner>,
}

impl Machine {
    pub fn new(
        db_path: impl AsRef<Path>,
        result_folder: impl Into<PathBuf>,
    ) -> Result<Self, EngineError> {
        let result_folder = result_folder.into();
        std::fs::create_dir_all(&result_folder)?;

        let store = KeyStore::open(db_path)?;
        let base_seed = store.ensure_base_seed()?;

        Ok(Self {
            result_folder,
            store,
            inner: Mutex::new(Inner {
                dkg_instances: HashMap::new(),
                sec_key: None,
                pub_key: None,
                encryption_key: None,
                base_seed: Some(base_seed),
                cleared: false,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, EngineError> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Crypto("machine lock poisoned".to_owned()))
    }

    /// Load the long-term keypair from the keystore, deriving and persisting
    /// it on first use.
    pub fn init_keys(&self) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        if inner.cleared {
            return Err(EngineError::SensitiveDataCleared);
        }
        if let Some((sec_key, pub_key)) = self.store.load_keypair()? {
            inner.sec_key = Some(sec_key);
            inner.pub_key = Some(pub_key);
            return Ok(());
        }
        let sec_key = dkg::derive_secret_key(inner.base_seed()?, &[b"machine-keypair"]);
        let pub_key = sec_key.public_key();
        self.store.save_keypair(&sec_key, &pub_key)?;
        inner.sec_key = Some(sec_key);
        inner.pub_key = Some(pub_key);
        Ok(())
    }

    /// The machine's long-term public key, as enrolled in proposals.
    pub fn pub_key_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let inner = self.lock()?;
        Ok(inner.pub_key()?.to_bytes().to_vec())
    }

    /// Install the key that seals keyrings at rest. Any passphrase is
    /// accepted; the key is its SHA-256.
    pub fn set_encryption_key(&self, passphrase: &[u8]) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        let digest: [u8; 32] = Sha256::digest(passphrase).into();
        inner.encryption_key = Some(Zeroizing::new(digest));
        inner.cleared = false;
        Ok(())
    }

    pub fn sensitive_data_removed(&self) -> bool {
        self.lock()
            .map(|inner| inner.cleared || inner.encryption_key.is_none())
            .unwrap_or(true)
    }

    /// Zero the long-term scalar, the encryption key, and the base seed.
    /// Handlers fail with `SensitiveDataCleared` afterwards.
    pub fn drop_sensitive_data(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.sec_key = None;
            inner.pub_key = None;
            inner.encryption_key = None;
            inner.base_seed = None;
            inner.dkg_instances.clear();
            inner.cleared = true;
        }
    }

    /// Execute one operation and write its reply file; non-signing
    /// operations are appended to the round's log when `store_operation` is
    /// set.
    pub fn process_operation(
        &self,
        operation: Operation,
        store_operation: bool,
    ) -> Result<PathBuf, EngineError> {
        let mut inner = self.lock()?;
        self.process_locked(&mut inner, operation, store_operation)
    }

    /// Replay every logged operation of a round through the regular
    /// processing path. Deterministic handlers make the reply files
    /// byte-identical to the first run.
    pub fn replay_operations_log(&self, dkg_id: &str) -> Result<Vec<PathBuf>, EngineError> {
        let mut inner = self.lock()?;
        let operations = self.store.operations_log(dkg_id)?;
        let mut paths = Vec::with_capacity(operations.len());
        for (idx, operation) in operations.into_iter().enumerate() {
            let path = self.process_locked(&mut inner, operation, false)?;
            tracing::info!(index = idx, path = %path.display(), "replayed operation");
            paths.push(path);
        }
        tracing::info!(dkg_id, "successfully replayed operation log");
        Ok(paths)
    }

    pub fn drop_operations_log(&self, dkg_id: &str) -> Result<(), EngineError> {
        self.store.drop_operations_log(dkg_id)
    }

    /// Check a recovered group signature for the given round.
    pub fn verify_sign(
        &self,
        msg: &[u8],
        signature: &[u8],
        dkg_id: &str,
    ) -> Result<(), EngineError> {
        let inner = self.lock()?;
        let keyring = self.store.load_keyring(dkg_id, inner.encryption_key()?)?;
        keyring.verify_sign(msg, signature)
    }

    /// Recover a full signature from partial signatures outside the normal
    /// operation flow (operator tooling).
    pub fn recover_full_sign(
        &self,
        msg: &[u8],
        sig_shares: &[(usize, Vec<u8>)],
        dkg_id: &str,
    ) -> Result<Vec<u8>, EngineError> {
        let inner = self.lock()?;
        let keyring = self.store.load_keyring(dkg_id, inner.encryption_key()?)?;
        keyring.recover_full_sign(msg, sig_shares)
    }

    pub(crate) fn store(&self) -> &KeyStore {
        &self.store
    }

    fn process_locked(
        &self,
        inner: &mut Inner,
        operation: Operation,
        store_operation: bool,
    ) -> Result<PathBuf, EngineError> {
        if inner.cleared {
            return Err(EngineError::SensitiveDataCleared);
        }

        let result = self.operation_result(inner, operation.clone())?;

        if store_operation && !operation.is_signing_state() {
            self.store
                .append_operation(&operation.dkg_identifier, &operation)?;
        }

        let bytes = serde_json::to_vec(&result)?;
        let path = self
            .result_folder
            .join(format!("{}_result.json", operation.filename()));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(&bytes)?;

        Ok(path)
    }

    /// Dispatch an operation to the handler for its state tag. A handler
    /// error becomes the state's error event inside the reply, so the quorum
    /// machine can progress to its cancellation branch.
    fn operation_result(
        &self,
        inner: &mut Inner,
        mut operation: Operation,
    ) -> Result<Operation, EngineError> {
        let op_type = operation.op_type.clone();
        let outcome = match op_type {
            s if s == STATE_REINIT_DKG => self.handle_reinit_dkg(inner, &mut operation),
            s if s == dkg_proposal::STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS => {
                self.handle_dkg_commits(inner, &mut operation)
            }
            s if s == dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS => {
                self.handle_dkg_deals(inner, &mut operation)
            }
            s if s == dkg_proposal::STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS => {
                self.handle_dkg_responses(inner, &mut operation)
            }
            s if s == dkg_proposal::STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS => {
                self.handle_dkg_master_key(inner, &mut operation)
            }
            s if s == signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS => {
                self.handle_partial_signs(inner, &mut operation)
            }
            s if s == signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED => {
                self.handle_reconstruct(inner, &mut operation)
            }
            other => Err(EngineError::InvalidOperationType(other.to_string())),
        };

        if let Err(err) = outcome {
            tracing::error!(
                operation_type = %operation.op_type,
                "failed to handle operation, replying with error event: {err}"
            );
            self.write_error_reply(inner, &mut operation, &err)?;
        }

        Ok(operation)
    }

    fn handle_reinit_dkg(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: DkgPubKeysParticipantResponse = serde_json::from_slice(&operation.payload)?;
        let instance = self.build_dkg_instance(inner, &operation.dkg_identifier, &payload)?;
        let confirmation = ReinitDkgConfirmation {
            participant_id: instance.participant_id,
            dkg_pub_key: inner.pub_key()?.to_bytes().to_vec(),
        };
        inner
            .dkg_instances
            .insert(operation.dkg_identifier.clone(), instance);

        let data = serde_json::to_vec(&confirmation)?;
        operation.event = Some(EVENT_REINIT_DKG_COMPLETED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn handle_dkg_commits(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: DkgPubKeysParticipantResponse = serde_json::from_slice(&operation.payload)?;
        let instance = self.build_dkg_instance(inner, &operation.dkg_identifier, &payload)?;

        let request = DkgCommitConfirmationRequest {
            participant_id: instance.participant_id,
            commit: instance.commit_bytes()?,
            created_at: operation.created_at,
        };
        inner
            .dkg_instances
            .insert(operation.dkg_identifier.clone(), instance);

        let data = serde_json::to_vec(&request)?;
        operation.event = Some(dkg_proposal::EVENT_DKG_COMMIT_CONFIRM_RECEIVED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn handle_dkg_deals(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: DkgCommitsParticipantResponse = serde_json::from_slice(&operation.payload)?;
        let base_seed = inner.base_seed()?.to_vec();
        let instance = inner
            .dkg_instances
            .get_mut(&operation.dkg_identifier)
            .ok_or_else(|| EngineError::UnknownDkgRound(operation.dkg_identifier.clone()))?;

        for entry in &payload.participants {
            if entry.participant_id == instance.participant_id {
                continue;
            }
            instance.process_commit(entry.participant_id, &entry.commit)?;
        }

        let request = DkgDealConfirmationRequest {
            participant_id: instance.participant_id,
            deals: instance.make_deals(&base_seed)?,
            created_at: operation.created_at,
        };
        let data = serde_json::to_vec(&request)?;
        operation.event = Some(dkg_proposal::EVENT_DKG_DEAL_CONFIRM_RECEIVED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn handle_dkg_responses(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: DkgDealsParticipantResponse = serde_json::from_slice(&operation.payload)?;
        let sec_key = inner.sec_key()?.clone();
        let instance = inner
            .dkg_instances
            .get_mut(&operation.dkg_identifier)
            .ok_or_else(|| EngineError::UnknownDkgRound(operation.dkg_identifier.clone()))?;

        let mut responses = Vec::new();
        for entry in &payload.participants {
            if entry.participant_id == instance.participant_id {
                continue;
            }
            let own_deal = entry
                .deals
                .iter()
                .find(|deal| deal.recipient_id == instance.participant_id)
                .ok_or_else(|| {
                    EngineError::VssVerificationFailed(format!(
                        "participant {} published no deal for us",
                        entry.participant_id
                    ))
                })?;
            let response = instance.process_deal(entry.participant_id, &sec_key, own_deal)?;
            responses.push(response);
        }

        let request = DkgResponseConfirmationRequest {
            participant_id: instance.participant_id,
            responses: bincode::serialize(&responses)?,
            created_at: operation.created_at,
        };
        let data = serde_json::to_vec(&request)?;
        operation.event = Some(dkg_proposal::EVENT_DKG_RESPONSE_CONFIRM_RECEIVED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn handle_dkg_master_key(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: DkgResponsesParticipantResponse =
            serde_json::from_slice(&operation.payload)?;
        let encryption_key = *inner.encryption_key()?;
        let instance = inner
            .dkg_instances
            .get_mut(&operation.dkg_identifier)
            .ok_or_else(|| EngineError::UnknownDkgRound(operation.dkg_identifier.clone()))?;

        for entry in &payload.participants {
            if entry.participant_id == instance.participant_id {
                continue;
            }
            instance.process_responses(entry.participant_id, &entry.responses)?;
        }

        let (keyring, master_key) = instance.finalize()?;
        self.store
            .save_keyring(&operation.dkg_identifier, &keyring, &encryption_key)?;

        let request = DkgMasterKeyConfirmationRequest {
            participant_id: instance.participant_id,
            master_key,
            created_at: operation.created_at,
        };
        let data = serde_json::to_vec(&request)?;
        operation.event = Some(dkg_proposal::EVENT_DKG_MASTER_KEY_CONFIRM_RECEIVED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn handle_partial_signs(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: SigningPartialSignsInvitationsResponse =
            serde_json::from_slice(&operation.payload)?;
        let keyring = self
            .store
            .load_keyring(&operation.dkg_identifier, inner.encryption_key()?)?;

        let partial_signs = payload
            .src_payload
            .iter()
            .map(|msg| PartialSignature {
                signing_id: msg.signing_id.clone(),
                sign: keyring.partial_sign(&msg.payload),
            })
            .collect();

        let request = SigningPartialSignsRequest {
            batch_id: payload.batch_id,
            participant_id: keyring.participant_id,
            partial_signs,
            created_at: operation.created_at,
        };
        let data = serde_json::to_vec(&request)?;
        operation.event = Some(signing_proposal::EVENT_SIGNING_PARTIAL_SIGN_RECEIVED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn handle_reconstruct(
        &self,
        inner: &mut Inner,
        operation: &mut Operation,
    ) -> Result<(), EngineError> {
        let payload: SigningProcessParticipantResponse =
            serde_json::from_slice(&operation.payload)?;
        let keyring = self
            .store
            .load_keyring(&operation.dkg_identifier, inner.encryption_key()?)?;

        let mut reconstructed = Vec::with_capacity(payload.src_payload.len());
        for msg in &payload.src_payload {
            let sig_shares: Vec<(usize, Vec<u8>)> = payload
                .participants
                .iter()
                .filter_map(|participant| {
                    participant
                        .partial_signs
                        .iter()
                        .find(|partial| partial.signing_id == msg.signing_id)
                        .map(|partial| (participant.participant_id, partial.sign.clone()))
                })
                .collect();

            let signature = keyring.recover_full_sign(&msg.payload, &sig_shares)?;
            keyring.verify_sign(&msg.payload, &signature)?;
            reconstructed.push(ReconstructedSignature {
                signing_id: msg.signing_id.clone(),
                src_payload: msg.payload.clone(),
                signature,
                dkg_round_id: operation.dkg_identifier.clone(),
            });
        }

        let data = serde_json::to_vec(&reconstructed)?;
        operation.event = Some(EVENT_SIGNATURE_RECONSTRUCTED);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }

    fn build_dkg_instance(
        &self,
        inner: &Inner,
        dkg_id: &str,
        payload: &DkgPubKeysParticipantResponse,
    ) -> Result<DkgInstance, EngineError> {
        let mut participants = BTreeMap::new();
        for entry in &payload.participants {
            participants.insert(
                entry.participant_id,
                DkgParticipant {
                    username: entry.username.clone(),
                    pub_key: dkg::pub_key_from_bytes(&entry.dkg_pub_key)?,
                },
            );
        }
        DkgInstance::new(
            dkg_id,
            payload.threshold,
            participants,
            inner.pub_key()?,
            inner.base_seed()?,
        )
    }

    fn participant_id(&self, inner: &Inner, dkg_id: &str) -> Result<usize, EngineError> {
        if let Some(instance) = inner.dkg_instances.get(dkg_id) {
            return Ok(instance.participant_id);
        }
        let keyring = self.store.load_keyring(dkg_id, inner.encryption_key()?)?;
        Ok(keyring.participant_id)
    }

    fn write_error_reply(
        &self,
        inner: &Inner,
        operation: &mut Operation,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        let error_event = error_event_for_state(&operation.op_type)?;
        let request = ConfirmationErrorRequest {
            participant_id: self.participant_id(inner, &operation.dkg_identifier)?,
            error: ErrorDetails::new(err),
            created_at: operation.created_at,
        };
        let data = serde_json::to_vec(&request)?;
        operation.event = Some(error_event);
        let message = create_message(operation, data);
        operation.result_msgs.push(message);
        Ok(())
    }
}

/// The error event a failed handler reports for each source state.
fn error_event_for_state(state: &State) -> Result<Event, EngineError> {
    let event = match state {
        s if *s == signature_proposal::STATE_AWAIT_PARTICIPANTS_CONFIRMATIONS => {
            signature_proposal::EVENT_DECLINE_PROPOSAL
        }
        s if *s == dkg_proposal::STATE_DKG_COMMITS_AWAIT_CONFIRMATIONS => {
            dkg_proposal::EVENT_DKG_COMMIT_CONFIRM_ERROR
        }
        s if *s == dkg_proposal::STATE_DKG_DEALS_AWAIT_CONFIRMATIONS => {
            dkg_proposal::EVENT_DKG_DEAL_CONFIRM_ERROR
        }
        s if *s == dkg_proposal::STATE_DKG_RESPONSES_AWAIT_CONFIRMATIONS => {
            dkg_proposal::EVENT_DKG_RESPONSE_CONFIRM_ERROR
        }
        s if *s == dkg_proposal::STATE_DKG_MASTER_KEY_AWAIT_CONFIRMATIONS => {
            dkg_proposal::EVENT_DKG_MASTER_KEY_CONFIRM_ERROR
        }
        s if *s == signing_proposal::STATE_SIGNING_AWAIT_PARTIAL_SIGNS => {
            signing_proposal::EVENT_SIGNING_PARTIAL_SIGN_ERROR
        }
        s if *s == signing_proposal::STATE_SIGNING_PARTIAL_SIGNS_COLLECTED => {
            EVENT_SIGNATURE_RECONSTRUCTION_FAILED
        }
        other => return Err(EngineError::InvalidOperationType(other.to_string())),
    };
    Ok(event)
}

/// Build the reply message the node will sign and broadcast. The node fills
/// in id, offset, sender, and signature when it posts to the bus.
fn create_message(operation: &Operation, data: Vec<u8>) -> Message {
    Message {
        id: String::new(),
        dkg_round_id: operation.dkg_identifier.clone(),
        offset: 0,
        event: operation
            .event
            .clone()
            .expect("event is set before building a reply message"),
        data,
        signature: Vec::new(),
        sender_addr: String::new(),
        recipient_addr: operation.to.clone(),
    }
}
