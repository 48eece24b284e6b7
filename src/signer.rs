// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Canonical payload construction and the signing capability boundary.
//!
//! Transactions are signed over an exact byte encoding with deterministic
//! field ordering. Re-serialization must reproduce identical bytes or
//! verification fails, so the canonical form is built once and carried with
//! the transaction rather than re-derived.
//!
//! Key custody sits behind [`TransactionSigner`]: the engine hands over a key
//! handle and the payload bytes and receives a signature. Raw key material
//! never crosses the boundary. [`SoftwareSigner`] is the in-process
//! implementation used in tests and software-only deployments.

use std::collections::HashMap;

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("unknown key handle: {0}")]
    UnknownKey(String),

    #[error("key store backend error: {0}")]
    Backend(String),
}

// =============================================================================
// Signed Transaction
// =============================================================================

/// A fare deduction receipt awaiting settlement.
///
/// Immutable once built, except for `signature`, which may be filled in later
/// when the initial signing attempt failed (the deduction is already
/// committed at that point and must never be dropped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Unique transaction id; the remote ledger deduplicates on it.
    pub tx_id: String,
    /// Deducted amount in minor units.
    pub amount: i64,
    /// Deduction time, epoch milliseconds.
    pub timestamp_ms: i64,
    /// Exact bytes the signature covers.
    pub payload: Vec<u8>,
    /// Signature over `payload`; `None` marks a placeholder pending
    /// re-signing.
    pub signature: Option<Vec<u8>>,
}

impl SignedTransaction {
    /// Build an unsigned transaction with a fresh id and the current time.
    pub fn build(amount: i64) -> Self {
        let tx_id = uuid::Uuid::new_v4().to_string();
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let payload = canonical_payload(&tx_id, amount, timestamp_ms);
        Self {
            tx_id,
            amount,
            timestamp_ms,
            payload,
            signature: None,
        }
    }

    /// Whether a signature is present.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

/// Canonical signed bytes: `tx_id|amount|timestamp_ms` in ASCII.
///
/// Field ordering is fixed; any deviation in the serialized form invalidates
/// verification.
pub fn canonical_payload(tx_id: &str, amount: i64, timestamp_ms: i64) -> Vec<u8> {
    format!("{tx_id}|{amount}|{timestamp_ms}").into_bytes()
}

// =============================================================================
// Signing Capability
// =============================================================================

/// Capability interface over the tamper-resistant key store.
pub trait TransactionSigner: Send + Sync {
    /// Sign `payload` with the key identified by `key_handle`.
    fn sign(&self, key_handle: &str, payload: &[u8]) -> Result<Vec<u8>, SignError>;
}

/// In-process ECDSA (secp256k1) signer holding software keys by alias.
///
/// RFC 6979 deterministic signing: the same key and payload always produce
/// the same signature bytes.
#[derive(Default)]
pub struct SoftwareSigner {
    keys: HashMap<String, SigningKey>,
}

impl SoftwareSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a key under the given alias.
    pub fn insert_key(&mut self, alias: impl Into<String>, key: SigningKey) {
        self.keys.insert(alias.into(), key);
    }

    /// Install a key from raw 32-byte scalar material.
    pub fn insert_key_bytes(
        &mut self,
        alias: impl Into<String>,
        bytes: &[u8],
    ) -> Result<(), SignError> {
        let key = SigningKey::from_slice(bytes).map_err(|e| SignError::Backend(e.to_string()))?;
        self.keys.insert(alias.into(), key);
        Ok(())
    }

    /// Verifying key for an installed alias (settlement-side verification).
    pub fn verifying_key(&self, alias: &str) -> Option<VerifyingKey> {
        self.keys.get(alias).map(|k| *k.verifying_key())
    }
}

impl TransactionSigner for SoftwareSigner {
    fn sign(&self, key_handle: &str, payload: &[u8]) -> Result<Vec<u8>, SignError> {
        let key = self
            .keys
            .get(key_handle)
            .ok_or_else(|| SignError::UnknownKey(key_handle.to_string()))?;
        let signature: Signature = key.sign(payload);
        Ok(signature.to_vec())
    }
}

/// Verify a signature over payload bytes against a verifying key.
pub fn verify_signature(key: &VerifyingKey, payload: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(payload, &sig).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> SoftwareSigner {
        let mut signer = SoftwareSigner::new();
        signer.insert_key_bytes("fare-key", &[0x42; 32]).unwrap();
        signer
    }

    #[test]
    fn canonical_payload_is_deterministic() {
        let a = canonical_payload("tx-1", 120, 1_700_000_000_000);
        let b = canonical_payload("tx-1", 120, 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a, b"tx-1|120|1700000000000".to_vec());
    }

    #[test]
    fn build_produces_matching_payload() {
        let tx = SignedTransaction::build(120);
        assert_eq!(
            tx.payload,
            canonical_payload(&tx.tx_id, tx.amount, tx.timestamp_ms)
        );
        assert!(!tx.is_signed());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = test_signer();
        let payload = canonical_payload("tx-1", 120, 1_700_000_000_000);
        let sig = signer.sign("fare-key", &payload).unwrap();

        let vk = signer.verifying_key("fare-key").unwrap();
        assert!(verify_signature(&vk, &payload, &sig));
    }

    #[test]
    fn single_byte_mutation_invalidates_signature() {
        let signer = test_signer();
        let payload = canonical_payload("tx-1", 120, 1_700_000_000_000);
        let sig = signer.sign("fare-key", &payload).unwrap();
        let vk = signer.verifying_key("fare-key").unwrap();

        for i in 0..payload.len() {
            let mut mutated = payload.clone();
            mutated[i] ^= 0x01;
            assert!(
                !verify_signature(&vk, &mutated, &sig),
                "mutation at byte {i} should invalidate the signature"
            );
        }
    }

    #[test]
    fn unknown_key_handle_is_an_error() {
        let signer = test_signer();
        let err = signer.sign("missing", b"payload").unwrap_err();
        assert!(matches!(err, SignError::UnknownKey(_)));
    }

    #[test]
    fn garbage_signature_bytes_fail_verification() {
        let signer = test_signer();
        let vk = signer.verifying_key("fare-key").unwrap();
        assert!(!verify_signature(&vk, b"payload", &[0u8; 7]));
    }
}
