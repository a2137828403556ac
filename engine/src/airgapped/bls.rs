//! Threshold BLS keyring: partial signing, recovery, verification.

use blsttc::serde_impl::SerdeSecret;
use blsttc::{PublicKeySet, SecretKeyShare, Signature, SignatureShare};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The participant's share of the group key together with the public
/// polynomial, produced once a DKG round reaches master-key collection.
/// Stored authenticated-encrypted under the machine encryption key.
#[derive(Serialize, Deserialize)]
pub struct BlsKeyring {
    pub share: SerdeSecret<SecretKeyShare>,
    pub pub_poly: PublicKeySet,
    pub participant_id: usize,
}

impl BlsKeyring {
    /// Minimum number of partial signatures needed for recovery.
    pub fn threshold(&self) -> usize {
        self.pub_poly.threshold() + 1
    }

    /// The group public key all participants agreed on.
    pub fn master_pub_key_bytes(&self) -> Vec<u8> {
        self.pub_poly.public_key().to_bytes().to_vec()
    }

    /// Deterministic BLS partial signature over `msg`.
    pub fn partial_sign(&self, msg: &[u8]) -> Vec<u8> {
        self.share.inner().sign(msg).to_bytes().to_vec()
    }

    /// Recover the full group signature from at least T valid partial
    /// signatures, indexed by participant id.
    pub fn recover_full_sign(
        &self,
        msg: &[u8],
        sig_shares: &[(usize, Vec<u8>)],
    ) -> Result<Vec<u8>, EngineError> {
        let mut valid = Vec::with_capacity(sig_shares.len());
        for (participant_id, bytes) in sig_shares {
            let raw: [u8; 96] = bytes.as_slice().try_into().map_err(|_| {
                EngineError::Crypto(format!(
                    "partial signature of participant {participant_id} has invalid length"
                ))
            })?;
            let share = SignatureShare::from_bytes(raw).map_err(|err| {
                EngineError::Crypto(format!(
                    "partial signature of participant {participant_id} is malformed: {err}"
                ))
            })?;
            if !self
                .pub_poly
                .public_key_share(*participant_id)
                .verify(&share, msg)
            {
                return Err(EngineError::Crypto(format!(
                    "partial signature of participant {participant_id} does not verify"
                )));
            }
            valid.push((*participant_id, share));
        }

        if valid.len() < self.threshold() {
            return Err(EngineError::ThresholdNotMet {
                required: self.threshold(),
                got: valid.len(),
            });
        }

        let signature = self
            .pub_poly
            .combine_signatures(valid.iter().map(|(id, share)| (*id, share)))
            .map_err(|err| EngineError::Crypto(format!("signature recovery failed: {err}")))?;

        Ok(signature.to_bytes().to_vec())
    }

    /// Check a recovered signature against the group public key.
    pub fn verify_sign(&self, msg: &[u8], signature: &[u8]) -> Result<(), EngineError> {
        let raw: [u8; 96] = signature
            .try_into()
            .map_err(|_| EngineError::Crypto("signature has invalid length".to_owned()))?;
        let signature = Signature::from_bytes(raw)
            .map_err(|err| EngineError::Crypto(format!("signature is malformed: {err}")))?;
        if !self.pub_poly.public_key().verify(&signature, msg) {
            return Err(EngineError::Crypto(
                "signature does not verify against the group public key".to_owned(),
            ));
        }
        Ok(())
    }
}
