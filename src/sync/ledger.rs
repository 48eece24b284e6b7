// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Remote ledger client.
//!
//! Settlement posts the signed transaction to `POST {base}/redeem`. The
//! remote deduplicates by the transaction id carried inside the canonical
//! payload, so duplicate submission after an ambiguous outcome is safe.
//!
//! Status triage: 4xx is a terminal client rejection and is never retried;
//! 5xx, transport failures, timeouts, and malformed bodies are all
//! retryable.

use std::future::Future;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};

use crate::signer::SignedTransaction;

/// Request timeout for one settlement call. Short on purpose: an ambiguous
/// outcome is kept retryable rather than holding the drain pass open.
pub const REDEEM_TIMEOUT: Duration = Duration::from_secs(3);

/// Response status value the ledger uses for a settled redemption.
pub const STATUS_SUCCESS: &str = "Success";

// =============================================================================
// Wire Types
// =============================================================================

/// Body of `POST /redeem`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub device_id: String,
    /// Base64 of the exact canonical payload bytes the signature covers.
    pub payload: String,
    /// Base64 of the signature.
    pub signature: String,
}

impl RedeemRequest {
    /// Build the wire request for a signed transaction.
    ///
    /// Returns `None` for unsigned placeholders; those must be re-signed
    /// before submission.
    pub fn for_transaction(device_id: &str, tx: &SignedTransaction) -> Option<Self> {
        let signature = tx.signature.as_deref()?;
        Some(Self {
            device_id: device_id.to_string(),
            payload: Base64::encode_string(&tx.payload),
            signature: Base64::encode_string(signature),
        })
    }
}

/// Successful body of `POST /redeem`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub status: String,
    pub new_balance: i64,
    #[serde(default)]
    pub fare_deducted: i64,
}

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// 4xx: the ledger definitively refused this transaction.
    #[error("client rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// 5xx: the ledger is unhealthy; retry later.
    #[error("server error ({0})")]
    Server(u16),

    /// Transport failure or timeout; retry later.
    #[error("network error: {0}")]
    Network(String),

    /// 2xx with a body we could not parse; ambiguous, retry later.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl LedgerError {
    /// Whether the sync engine may submit this transaction again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LedgerError::Rejected { .. })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Capability interface over the remote ledger.
pub trait LedgerClient: Send + Sync + 'static {
    /// Submit one redemption and return the parsed outcome.
    fn redeem(
        &self,
        request: &RedeemRequest,
    ) -> impl Future<Output = Result<RedeemResponse, LedgerError>> + Send;
}

/// HTTP+JSON ledger client (reqwest, rustls).
pub struct HttpLedgerClient {
    client: reqwest::Client,
    redeem_url: String,
}

impl HttpLedgerClient {
    /// Build a client for the given base URL (e.g. `https://ledger.example`).
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(REDEEM_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Network(e.to_string()))?;
        Ok(Self {
            client,
            redeem_url: format!("{}/redeem", base_url.trim_end_matches('/')),
        })
    }
}

impl LedgerClient for HttpLedgerClient {
    async fn redeem(&self, request: &RedeemRequest) -> Result<RedeemResponse, LedgerError> {
        let response = self
            .client
            .post(&self.redeem_url)
            .json(request)
            .send()
            .await
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let reason = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }
        if status.is_server_error() {
            return Err(LedgerError::Server(status.as_u16()));
        }

        response
            .json::<RedeemResponse>()
            .await
            .map_err(|e| LedgerError::Malformed(e.to_string()))
    }
}

// =============================================================================
// Test Double
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_payload_and_signature_base64() {
        let mut tx = SignedTransaction::build(120);
        tx.signature = Some(vec![0x01, 0x02, 0x03]);

        let request = RedeemRequest::for_transaction("device-1", &tx).unwrap();
        assert_eq!(request.device_id, "device-1");
        assert_eq!(
            Base64::decode_vec(&request.payload).unwrap(),
            tx.payload
        );
        assert_eq!(
            Base64::decode_vec(&request.signature).unwrap(),
            vec![0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn unsigned_placeholder_yields_no_request() {
        let tx = SignedTransaction::build(120);
        assert!(RedeemRequest::for_transaction("device-1", &tx).is_none());
    }

    #[test]
    fn request_wire_field_names_are_camel_case() {
        let request = RedeemRequest {
            device_id: "d".into(),
            payload: "cA==".into(),
            signature: "cw==".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"deviceId": "d", "payload": "cA==", "signature": "cw=="})
        );
    }

    #[test]
    fn response_parses_ledger_body() {
        let body = r#"{"status":"Success","newBalance":380,"fareDeducted":120}"#;
        let response: RedeemResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.status, STATUS_SUCCESS);
        assert_eq!(response.new_balance, 380);
        assert_eq!(response.fare_deducted, 120);
    }

    #[test]
    fn rejection_is_terminal_everything_else_retryable() {
        assert!(!LedgerError::Rejected {
            status: 400,
            reason: "invalid signature".into()
        }
        .is_retryable());
        assert!(LedgerError::Server(503).is_retryable());
        assert!(LedgerError::Network("timeout".into()).is_retryable());
        assert!(LedgerError::Malformed("truncated".into()).is_retryable());
    }
}
