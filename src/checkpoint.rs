//! C5: `CheckpointSigner` — produces signed tree heads (spec §4.5).

use p256::ecdsa::VerifyingKey;

use crate::cose::{self, CheckpointPayload, CoseSigner, ReceiptPayload};
use crate::errors::LogError;
use crate::hash::Hash;

/// Holds the service's ES256 key and `origin` string, and turns
/// `(tree_size, root)` pairs into signed checkpoint bytes.
pub struct CheckpointSigner {
    signer: CoseSigner,
    origin: String,
}

impl CheckpointSigner {
    pub fn new(signer: CoseSigner, origin: impl Into<String>) -> Self {
        Self {
            signer,
            origin: origin.into(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    /// `make_checkpoint(tree_size, root, now)` (spec §4.5). `now` is passed
    /// in rather than read from the clock here, so the signed timestamp is
    /// reproducible in tests.
    pub fn make_checkpoint(&self, tree_size: u64, root: Hash, now: u64) -> Result<Vec<u8>, LogError> {
        let payload = CheckpointPayload {
            origin: self.origin.clone(),
            tree_size,
            root_hash: root,
            timestamp: now,
        };
        self.signer.sign_checkpoint(&payload)
    }

    /// Sign a receipt with the same key used for checkpoints (spec §4.5).
    pub fn sign_receipt(&self, tree_size: u64, payload: &ReceiptPayload) -> Result<Vec<u8>, LogError> {
        self.signer.sign_receipt(tree_size, payload)
    }

    /// `verify_checkpoint(bytes, public_key)` (spec §4.5). Also checks the
    /// payload's `origin` matches this signer's, since a checkpoint from a
    /// different log origin is not a valid tree head for this one.
    pub fn verify_checkpoint(&self, bytes: &[u8], public_key: &VerifyingKey) -> Result<CheckpointPayload, LogError> {
        let payload = cose::verify_checkpoint(bytes, public_key)?;
        if payload.origin != self.origin {
            return Err(LogError::InvalidCose(format!(
                "checkpoint origin {:?} does not match log origin {:?}",
                payload.origin, self.origin
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    #[test]
    fn make_checkpoint_round_trips() {
        let signing_key = SigningKey::random(&mut OsRng);
        let signer = CheckpointSigner::new(CoseSigner::new(signing_key, b"kid-1".to_vec()), "example-log");

        let bytes = signer.make_checkpoint(10, [9u8; 32], 1_700_000_000).unwrap();
        let verifying_key = signer.verifying_key();
        let payload = signer.verify_checkpoint(&bytes, &verifying_key).unwrap();

        assert_eq!(payload.tree_size, 10);
        assert_eq!(payload.root_hash, [9u8; 32]);
        assert_eq!(payload.origin, "example-log");
    }

    #[test]
    fn verify_checkpoint_rejects_foreign_origin() {
        let signing_key = SigningKey::random(&mut OsRng);
        let signer = CheckpointSigner::new(CoseSigner::new(signing_key, b"kid-1".to_vec()), "example-log");
        let other = CheckpointSigner::new(
            CoseSigner::new(SigningKey::random(&mut OsRng), b"kid-2".to_vec()),
            "other-log",
        );

        let bytes = other.make_checkpoint(1, [1u8; 32], 1).unwrap();
        let other_key = other.verifying_key();
        assert!(signer.verify_checkpoint(&bytes, &other_key).is_err());
    }
}
