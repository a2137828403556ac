//! Per-round DKG state: a joint Pedersen-style VSS over BLS12-381.
//!
//! Each participant deals a random polynomial of degree T-1. Commits are
//! broadcast, shares travel encrypted to their recipient, verification
//! responses are broadcast, and the keyring is the sum of all dealt shares
//! against the sum of all commitments. The secret polynomial is derived from
//! the machine base seed and the round id, so a wiped machine re-derives
//! identical secrets on replay.

use std::collections::BTreeMap;

use blsttc::poly::{Commitment, Poly};
use blsttc::serde_impl::{FieldWrap, SerdeSecret};
use blsttc::{Ciphertext, Fr, PublicKey, PublicKeySet, SecretKey, SecretKeyShare};
use ff::Field;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::machines::payload::EncryptedDeal;

use super::bls::BlsKeyring;

/// One quorum member as the air-gapped machine sees it.
#[derive(Debug, Clone)]
pub struct DkgParticipant {
    pub username: String,
    pub pub_key: PublicKey,
}

/// A dealt share addressed to one recipient, before encryption.
#[derive(Serialize, Deserialize)]
struct DealPayload {
    dealer_id: usize,
    share: FieldWrap<Fr>,
}

/// Broadcast verdict on one received deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealResponse {
    pub dealer_id: usize,
    pub verified: bool,
}

pub struct DkgInstance {
    pub dkg_id: String,
    pub threshold: usize,
    pub participant_id: usize,
    pub participants: BTreeMap<usize, DkgParticipant>,
    secret_poly: Poly,
    commits: BTreeMap<usize, Commitment>,
    shares: BTreeMap<usize, Fr>,
}

impl DkgInstance {
    pub fn new(
        dkg_id: &str,
        threshold: usize,
        participants: BTreeMap<usize, DkgParticipant>,
        own_pub_key: &PublicKey,
        base_seed: &[u8],
    ) -> Result<Self, EngineError> {
        let n = participants.len();
        if n < 2 {
            return Err(EngineError::Crypto(
                "a dkg round requires at least two participants".to_owned(),
            ));
        }
        if threshold < 1 || threshold > n {
            return Err(EngineError::Crypto(format!(
                "threshold must be within [1, {n}], got {threshold}"
            )));
        }

        let participant_id = participants
            .iter()
            .find(|(_, p)| p.pub_key == *own_pub_key)
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                EngineError::Crypto("own public key is not in the participant set".to_owned())
            })?;

        let mut rng = StdRng::from_seed(derive_seed(base_seed, &[dkg_id.as_bytes(), b"vss-poly"]));
        let secret_poly = Poly::random(threshold - 1, &mut rng);

        let mut instance = Self {
            dkg_id: dkg_id.to_owned(),
            threshold,
            participant_id,
            participants,
            commits: BTreeMap::new(),
            shares: BTreeMap::new(),
            secret_poly,
        };
        instance.commits.insert(
            instance.participant_id,
            instance.secret_poly.commitment(),
        );
        instance.shares.insert(
            instance.participant_id,
            instance
                .secret_poly
                .evaluate(instance.participant_id as u64 + 1),
        );
        Ok(instance)
    }

    pub fn n(&self) -> usize {
        self.participants.len()
    }

    pub fn username(&self) -> Option<&str> {
        self.participants
            .get(&self.participant_id)
            .map(|p| p.username.as_str())
    }

    /// This participant's broadcast VSS commitment.
    pub fn commit_bytes(&self) -> Result<Vec<u8>, EngineError> {
        Ok(bincode::serialize(&self.secret_poly.commitment())?)
    }

    /// Register another participant's broadcast commitment.
    pub fn process_commit(&mut self, from: usize, commit: &[u8]) -> Result<(), EngineError> {
        if !self.participants.contains_key(&from) {
            return Err(EngineError::Crypto(format!(
                "commit from unknown participant {from}"
            )));
        }
        let commit: Commitment = bincode::deserialize(commit)?;
        if commit.degree() != self.threshold - 1 {
            return Err(EngineError::VssVerificationFailed(format!(
                "commitment of participant {from} has degree {}, expected {}",
                commit.degree(),
                self.threshold - 1
            )));
        }
        self.commits.insert(from, commit);
        Ok(())
    }

    /// Produce N-1 deals, each encrypted to its recipient's long-term
    /// public key. Encryption randomness is derived from the base seed so
    /// replay regenerates byte-identical deals.
    pub fn make_deals(&self, base_seed: &[u8]) -> Result<Vec<EncryptedDeal>, EngineError> {
        let mut deals = Vec::with_capacity(self.n() - 1);
        for (&id, participant) in &self.participants {
            if id == self.participant_id {
                continue;
            }
            let payload = DealPayload {
                dealer_id: self.participant_id,
                share: FieldWrap(self.secret_poly.evaluate(id as u64 + 1)),
            };
            let plaintext = bincode::serialize(&payload)?;
            let mut rng = StdRng::from_seed(derive_seed(
                base_seed,
                &[
                    self.dkg_id.as_bytes(),
                    b"deal",
                    &(self.participant_id as u64).to_be_bytes(),
                    &(id as u64).to_be_bytes(),
                ],
            ));
            let ciphertext = participant.pub_key.encrypt_with_rng(&mut rng, &plaintext);
            deals.push(EncryptedDeal {
                recipient_id: id,
                data: bincode::serialize(&ciphertext)?,
            });
        }
        Ok(deals)
    }

    /// Decrypt and verify a deal addressed to this participant; a failed
    /// verification is reported, not swallowed.
    pub fn process_deal(
        &mut self,
        from: usize,
        sec_key: &SecretKey,
        deal: &EncryptedDeal,
    ) -> Result<DealResponse, EngineError> {
        if deal.recipient_id != self.participant_id {
            return Err(EngineError::Crypto(format!(
                "deal from participant {from} is addressed to participant {}",
                deal.recipient_id
            )));
        }
        let ciphertext: Ciphertext = bincode::deserialize(&deal.data)?;
        let plaintext = sec_key.decrypt(&ciphertext).ok_or_else(|| {
            EngineError::DecryptionFailed(format!("cannot decrypt deal from participant {from}"))
        })?;
        let payload: DealPayload = bincode::deserialize(&plaintext)?;
        if payload.dealer_id != from {
            return Err(EngineError::VssVerificationFailed(format!(
                "deal claims dealer {}, delivered by {from}",
                payload.dealer_id
            )));
        }

        let commit = self.commits.get(&from).ok_or_else(|| {
            EngineError::VssVerificationFailed(format!("no commitment from participant {from}"))
        })?;
        let share = payload.share.into_inner();
        let mut probe = share;
        let share_pub = SecretKeyShare::from_mut(&mut probe).public_key_share();
        let expected = PublicKeySet::from(commit.clone()).public_key_share(self.participant_id);

        let verified = share_pub == expected;
        if verified {
            self.shares.insert(from, share);
        }
        Ok(DealResponse {
            dealer_id: from,
            verified,
        })
    }

    /// Check another participant's broadcast verification responses.
    pub fn process_responses(&self, from: usize, responses: &[u8]) -> Result<(), EngineError> {
        let responses: Vec<DealResponse> = bincode::deserialize(responses)?;
        for response in responses {
            if !response.verified {
                return Err(EngineError::VssVerificationFailed(format!(
                    "participant {from} rejected the deal of participant {}",
                    response.dealer_id
                )));
            }
        }
        Ok(())
    }

    /// Sum all dealt shares and commitments into the final keyring and the
    /// group public key.
    pub fn finalize(&self) -> Result<(BlsKeyring, Vec<u8>), EngineError> {
        if self.commits.len() < self.n() {
            return Err(EngineError::ThresholdNotMet {
                required: self.n(),
                got: self.commits.len(),
            });
        }
        if self.shares.len() < self.n() {
            return Err(EngineError::ThresholdNotMet {
                required: self.n(),
                got: self.shares.len(),
            });
        }

        let mut commits = self.commits.values();
        let mut pub_commit = commits.next().expect("commits are not empty").clone();
        for commit in commits {
            pub_commit += commit.clone();
        }

        let mut sec = Fr::zero();
        for share in self.shares.values() {
            sec += share;
        }

        let keyring = BlsKeyring {
            share: SerdeSecret(SecretKeyShare::from_mut(&mut sec)),
            pub_poly: PublicKeySet::from(pub_commit),
            participant_id: self.participant_id,
        };
        let master_key = keyring.master_pub_key_bytes();
        Ok((keyring, master_key))
    }
}

/// SHA-256 of the base seed plus context labels, as an RNG seed.
pub(crate) fn derive_seed(base_seed: &[u8], context: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(base_seed);
    for part in context {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Deterministic long-term keypair derivation from the base seed.
pub(crate) fn derive_secret_key(base_seed: &[u8], context: &[&[u8]]) -> SecretKey {
    let mut rng = StdRng::from_seed(derive_seed(base_seed, context));
    let mut fr = Fr::random(&mut rng);
    SecretKey::from_mut(&mut fr)
}

pub(crate) fn pub_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, EngineError> {
    let raw: [u8; 48] = bytes
        .try_into()
        .map_err(|_| EngineError::Crypto("public key has invalid length".to_owned()))?;
    PublicKey::from_bytes(raw)
        .map_err(|err| EngineError::Crypto(format!("public key is malformed: {err}")))
}
