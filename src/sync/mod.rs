// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sync Engine
//!
//! Drains the offline queue against the remote ledger and reconciles the
//! authoritative balance.
//!
//! ## Per-transaction state machine
//!
//! Pending --sync--> Settled (remove, adopt remote balance)
//!                 | Rejected (remove, report, never retry)
//!                 | Retry    (keep, exponential backoff)
//!
//! Ambiguous outcomes (timeout, malformed body) count as retryable: the
//! remote deduplicates by transaction id, so resubmission can never
//! double-deduct, while dropping an unconfirmed entry could lose money.
//!
//! Only one drain pass runs at a time across all trigger sources; a pass
//! finding the lock held skips instead of queuing behind it.

pub mod ledger;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::balance::BalanceCache;
use crate::events::{EventSink, FareEvent};
use crate::signer::{SignedTransaction, TransactionSigner};
use crate::storage::{DeviceIdentity, Disposition, OfflineQueue};

use ledger::{LedgerClient, LedgerError, RedeemRequest, STATUS_SUCCESS};

/// Base delay after the first failed pass.
const BACKOFF_BASE_SECS: u64 = 10;

/// Ceiling for the exponential backoff.
const BACKOFF_CAP_SECS: u64 = 300;

/// Outcome of syncing one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Settled remotely; adopt the returned balance.
    Settled { new_balance: i64 },
    /// Terminally rejected; drop and report.
    Rejected { reason: String },
    /// Server or network trouble; keep for the next pass.
    Retry,
}

/// Result of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub settled: usize,
    pub rejected: usize,
    pub kept: usize,
    /// Another pass was already in flight; nothing was done.
    pub skipped: bool,
}

/// Settlement engine over an injected queue, balance cache, and ledger.
pub struct SyncEngine<L> {
    queue: OfflineQueue,
    balance: Arc<BalanceCache>,
    signer: Arc<dyn TransactionSigner>,
    ledger: L,
    identity: DeviceIdentity,
    events: EventSink,
    pass_lock: tokio::sync::Mutex<()>,
    consecutive_failures: AtomicU32,
}

impl<L: LedgerClient> SyncEngine<L> {
    pub fn new(
        queue: OfflineQueue,
        balance: Arc<BalanceCache>,
        signer: Arc<dyn TransactionSigner>,
        ledger: L,
        identity: DeviceIdentity,
        events: EventSink,
    ) -> Self {
        Self {
            queue,
            balance,
            signer,
            ledger,
            identity,
            events,
            pass_lock: tokio::sync::Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Run one drain pass over a snapshot of the queue.
    ///
    /// Skips immediately when another pass holds the lock, whatever its
    /// trigger source was.
    pub async fn run_pass(&self) -> PassSummary {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("Drain pass already in flight, skipping");
            return PassSummary {
                skipped: true,
                ..PassSummary::default()
            };
        };

        let entries = match self.queue.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to read offline queue");
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                return PassSummary::default();
            }
        };

        if entries.is_empty() {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return PassSummary::default();
        }

        info!(pending = entries.len(), "Drain pass starting");

        let mut summary = PassSummary::default();
        let mut dispositions: HashMap<String, Disposition> = HashMap::new();

        for tx in &entries {
            match self.sync_one(tx).await {
                SyncOutcome::Settled { new_balance } => {
                    self.balance.adopt_settled(new_balance);
                    self.events.emit(FareEvent::TransactionSettled {
                        tx_id: tx.tx_id.clone(),
                        new_balance,
                    });
                    self.events.emit(FareEvent::BalanceUpdated {
                        balance: new_balance,
                    });
                    dispositions.insert(tx.tx_id.clone(), Disposition::Settled);
                    summary.settled += 1;
                }
                SyncOutcome::Rejected { reason } => {
                    warn!(tx_id = %tx.tx_id, reason = %reason, "Transaction rejected by ledger");
                    self.events.emit(FareEvent::TransactionRejected {
                        tx_id: tx.tx_id.clone(),
                        reason,
                    });
                    dispositions.insert(tx.tx_id.clone(), Disposition::Terminal);
                    summary.rejected += 1;
                }
                SyncOutcome::Retry => {
                    summary.kept += 1;
                }
            }
        }

        // Entries enqueued during the pass carry no disposition and are kept
        // untouched for the next one.
        match self.queue.drain(|tx| {
            dispositions
                .get(&tx.tx_id)
                .copied()
                .unwrap_or(Disposition::Keep)
        }) {
            Ok(remaining) => {
                info!(
                    settled = summary.settled,
                    rejected = summary.rejected,
                    kept = summary.kept,
                    remaining,
                    "Drain pass finished"
                );
            }
            Err(e) => {
                // Settled entries stay queued; resubmission is idempotent.
                warn!(error = %e, "Failed to apply drain dispositions");
            }
        }

        if summary.kept > 0 {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }

        summary
    }

    /// Sync a single transaction, re-signing placeholders first.
    pub async fn sync_one(&self, tx: &SignedTransaction) -> SyncOutcome {
        let tx = match self.ensure_signed(tx) {
            Some(tx) => tx,
            None => return SyncOutcome::Retry,
        };

        let Some(request) = RedeemRequest::for_transaction(&self.identity.device_id, &tx) else {
            return SyncOutcome::Retry;
        };

        match self.ledger.redeem(&request).await {
            Ok(response) if response.status == STATUS_SUCCESS => {
                debug!(
                    tx_id = %tx.tx_id,
                    new_balance = response.new_balance,
                    fare_deducted = response.fare_deducted,
                    "Transaction settled"
                );
                SyncOutcome::Settled {
                    new_balance: response.new_balance,
                }
            }
            // A well-formed 200 with any other status is a definitive answer
            Ok(response) => SyncOutcome::Rejected {
                reason: response.status,
            },
            Err(e) if e.is_retryable() => {
                debug!(tx_id = %tx.tx_id, error = %e, "Retryable sync failure");
                SyncOutcome::Retry
            }
            Err(LedgerError::Rejected { status, reason }) => SyncOutcome::Rejected {
                reason: format!("{status}: {reason}"),
            },
            Err(_) => SyncOutcome::Retry,
        }
    }

    /// Delay before the next pass, `None` when the last pass was clean.
    pub fn retry_backoff(&self) -> Option<Duration> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures == 0 {
            return None;
        }
        let exponent = (failures - 1).min(5);
        let secs = (BACKOFF_BASE_SECS << exponent).min(BACKOFF_CAP_SECS);
        Some(Duration::from_secs(secs))
    }

    /// Re-sign an unsigned placeholder and persist the signature.
    ///
    /// The deduction behind a placeholder is already committed; while signing
    /// stays unavailable the entry is kept, never dropped.
    fn ensure_signed(&self, tx: &SignedTransaction) -> Option<SignedTransaction> {
        if tx.is_signed() {
            return Some(tx.clone());
        }

        match self.signer.sign(&self.identity.key_alias, &tx.payload) {
            Ok(signature) => {
                let mut signed = tx.clone();
                signed.signature = Some(signature);
                if let Err(e) = self.queue.update(&signed) {
                    warn!(tx_id = %tx.tx_id, error = %e, "Failed to persist re-signed transaction");
                }
                Some(signed)
            }
            Err(e) => {
                warn!(tx_id = %tx.tx_id, error = %e, "Re-signing still failing, keeping placeholder");
                None
            }
        }
    }
}
