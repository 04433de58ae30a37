//! Authorization adapter that accepts every permission.
//!
//! Signatures are `key ++ digest`, so the signer is recoverable from the
//! signature bytes alone. Useful wherever real cryptography is out of scope.

use crate::domain::TransactionDeadline;
use crate::error::{ChainError, ChainResult};
use crate::ports::Authorization;
use qc_04_versioned_state::Database;
use shared_types::{Action, Digest, Microseconds, PublicKey, Signature, TimePoint};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAuthorization;

impl PermissiveAuthorization {
    pub fn sign(key: &[u8], digest: &Digest) -> Signature {
        let mut signature = key.to_vec();
        signature.extend_from_slice(digest);
        signature
    }
}

impl Authorization for PermissiveAuthorization {
    fn check_authorization(
        &self,
        _db: &Database,
        _actions: &[Action],
        _provided_keys: &BTreeSet<PublicKey>,
        _delay: Microseconds,
        deadline: &TransactionDeadline,
    ) -> ChainResult<()> {
        deadline.checktime(TimePoint::now())
    }

    fn recover_key(&self, signature: &Signature, digest: &Digest) -> ChainResult<PublicKey> {
        let split = signature
            .len()
            .checked_sub(digest.len())
            .filter(|&at| at > 0)
            .ok_or_else(|| ChainError::Unauthorized("signature is too short".into()))?;
        if &signature[split..] != digest.as_slice() {
            return Err(ChainError::Unauthorized(
                "signature was not made over the expected digest".into(),
            ));
        }
        Ok(signature[..split].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recover_returns_signing_key() {
        let digest = [1u8; 32];
        let sig = PermissiveAuthorization::sign(b"alice", &digest);
        assert_eq!(PermissiveAuthorization.recover_key(&sig, &digest).unwrap(), b"alice".to_vec());
        assert!(PermissiveAuthorization.recover_key(&sig, &[2u8; 32]).is_err());
        assert!(PermissiveAuthorization.recover_key(&digest.to_vec(), &digest).is_err());
    }
}
