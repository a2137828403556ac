//! The machine's persistent key-value store.
//!
//! Layout: `base_seed` (32 random bytes fixed at first init), the long-term
//! keypair under `seckey`/`pubkey`, one sealed keyring per round under
//! `bls:<dkgID>`, and one append-only operation log per round under
//! `oplog:<dkgID>`. Keyrings are the only values encrypted at rest; they are
//! sealed with AES-256-GCM under the operator-supplied encryption key.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use blsttc::serde_impl::SerdeSecret;
use blsttc::{PublicKey, SecretKey};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::EngineError;
use crate::types::Operation;

use super::bls::BlsKeyring;

const BASE_SEED_KEY: &str = "base_seed";
const PUB_KEY: &str = "pubkey";
const SEC_KEY: &str = "seckey";

const SEED_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

fn bls_key(dkg_id: &str) -> String {
    format!("bls:{dkg_id}")
}

fn oplog_key(dkg_id: &str) -> String {
    format!("oplog:{dkg_id}")
}

pub struct KeyStore {
    db: sled::Db,
}

impl KeyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Load the base seed, creating it on first init.
    pub fn ensure_base_seed(&self) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        if let Some(seed) = self.db.get(BASE_SEED_KEY)? {
            return Ok(Zeroizing::new(seed.to_vec()));
        }
        let mut seed = Zeroizing::new(vec![0u8; SEED_SIZE]);
        rand::thread_rng().fill_bytes(&mut seed);
        self.db.insert(BASE_SEED_KEY, seed.as_slice())?;
        self.db.flush()?;
        Ok(seed)
    }

    pub fn load_keypair(&self) -> Result<Option<(SecretKey, PublicKey)>, EngineError> {
        let (Some(sec), Some(pub_key)) = (self.db.get(SEC_KEY)?, self.db.get(PUB_KEY)?) else {
            return Ok(None);
        };
        let sec: SerdeSecret<SecretKey> = bincode::deserialize(&sec)?;
        let pub_key: PublicKey = bincode::deserialize(&pub_key)?;
        Ok(Some((sec.into_inner(), pub_key)))
    }

    pub fn save_keypair(
        &self,
        sec_key: &SecretKey,
        pub_key: &PublicKey,
    ) -> Result<(), EngineError> {
        self.db
            .insert(SEC_KEY, bincode::serialize(&SerdeSecret(sec_key))?)?;
        self.db.insert(PUB_KEY, bincode::serialize(pub_key)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn save_keyring(
        &self,
        dkg_id: &str,
        keyring: &BlsKeyring,
        encryption_key: &[u8; 32],
    ) -> Result<(), EngineError> {
        let sealed = seal(encryption_key, &bincode::serialize(keyring)?)?;
        self.db.insert(bls_key(dkg_id).as_bytes(), sealed)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_keyring(
        &self,
        dkg_id: &str,
        encryption_key: &[u8; 32],
    ) -> Result<BlsKeyring, EngineError> {
        let sealed = self
            .db
            .get(bls_key(dkg_id).as_bytes())?
            .ok_or_else(|| EngineError::UnknownDkgRound(dkg_id.to_owned()))?;
        let plaintext = unseal(encryption_key, &sealed)?;
        Ok(bincode::deserialize(&plaintext)?)
    }

    pub fn has_keyring(&self, dkg_id: &str) -> Result<bool, EngineError> {
        Ok(self.db.contains_key(bls_key(dkg_id).as_bytes())?)
    }

    pub fn append_operation(&self, dkg_id: &str, operation: &Operation) -> Result<(), EngineError> {
        let mut log = match self.db.get(oplog_key(dkg_id).as_bytes())? {
            Some(raw) => serde_json::from_slice::<Vec<Operation>>(&raw)?,
            None => Vec::new(),
        };
        log.push(operation.clone());
        self.db
            .insert(oplog_key(dkg_id).as_bytes(), serde_json::to_vec(&log)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn operations_log(&self, dkg_id: &str) -> Result<Vec<Operation>, EngineError> {
        let raw = self
            .db
            .get(oplog_key(dkg_id).as_bytes())?
            .ok_or_else(|| EngineError::UnknownDkgRound(dkg_id.to_owned()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn drop_operations_log(&self, dkg_id: &str) -> Result<(), EngineError> {
        self.db.remove(oplog_key(dkg_id).as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Remove everything except the base seed and the operation logs; used
    /// to exercise deterministic replay.
    pub fn wipe_key_material(&self, dkg_id: &str) -> Result<(), EngineError> {
        self.db.remove(SEC_KEY)?;
        self.db.remove(PUB_KEY)?;
        self.db.remove(bls_key(dkg_id).as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|err| EngineError::Crypto(format!("invalid encryption key: {err}")))?;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|err| EngineError::Crypto(format!("sealing failed: {err}")))?;
    let mut sealed = nonce.to_vec();
    sealed.extend(ciphertext);
    Ok(sealed)
}

fn unseal(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, EngineError> {
    if sealed.len() < NONCE_SIZE {
        return Err(EngineError::DecryptionFailed(
            "sealed value is too short".to_owned(),
        ));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|err| EngineError::Crypto(format!("invalid encryption key: {err}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|err| EngineError::DecryptionFailed(err.to_string()))
}
