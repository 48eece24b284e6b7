// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authoritative local balance with serialized mutation.
//!
//! All deductions pass through one mutex-guarded critical section spanning
//! load-if-absent, compare, subtract, and the in-memory update. Once warm,
//! the in-memory value is authoritative for every read; rapid repeated
//! presentations therefore always see the latest value and can never
//! double-spend.
//!
//! Persistence is write-behind: each mutation publishes the new value on a
//! `watch` channel drained by [`run_balance_flusher`]. The channel holds at
//! most the latest pending value, so persisted state lags memory by at most
//! one write.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{FareStore, StoreResult};

/// Outcome of a deduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deduction {
    /// Fare deducted; `new_balance` is the updated cached value.
    Ok { new_balance: i64 },
    /// Fare exceeds the balance; nothing changed.
    InsufficientFunds { balance: i64 },
    /// No balance has ever been provisioned on this device.
    NotProvisioned,
}

/// In-memory balance cell with lazy load and write-behind persistence.
pub struct BalanceCache {
    store: Arc<FareStore>,
    cell: Mutex<Option<i64>>,
    persist: watch::Sender<Option<i64>>,
}

impl BalanceCache {
    pub fn new(store: Arc<FareStore>) -> Self {
        let (persist, _) = watch::channel(None);
        Self {
            store,
            cell: Mutex::new(None),
            persist,
        }
    }

    /// Lock the cell, recovering the value if a holder panicked.
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<i64>> {
        self.cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attempt to deduct `fare` from the cached balance.
    ///
    /// Fully serialized: concurrent callers queue on the internal lock and
    /// each sees the value left by the previous one. Never returns `Ok` when
    /// the fare exceeds the balance.
    pub fn try_deduct(&self, fare: u32) -> StoreResult<Deduction> {
        let mut cell = self.lock();

        // Lazy load on first command of the session
        let balance = match *cell {
            Some(b) => b,
            None => match self.store.balance()? {
                Some(b) => {
                    *cell = Some(b);
                    b
                }
                None => return Ok(Deduction::NotProvisioned),
            },
        };

        let fare = i64::from(fare);
        if fare > balance {
            return Ok(Deduction::InsufficientFunds { balance });
        }

        let new_balance = balance - fare;
        *cell = Some(new_balance);
        self.persist.send_replace(Some(new_balance));
        Ok(Deduction::Ok { new_balance })
    }

    /// Adopt an authoritative post-settlement balance from the remote ledger.
    ///
    /// Unconditional for the settled request's outcome; subsequent deductions
    /// read the adopted value and layer on top of it.
    pub fn adopt_settled(&self, new_balance: i64) {
        let mut cell = self.lock();
        *cell = Some(new_balance);
        self.persist.send_replace(Some(new_balance));
    }

    /// Current cached value without touching the store.
    pub fn current(&self) -> Option<i64> {
        *self.lock()
    }

    /// Drop the cached value (deregistration/logout). The next command loads
    /// from the store again.
    pub fn invalidate(&self) {
        let mut cell = self.lock();
        *cell = None;
        debug!("Balance cache invalidated");
    }

    /// Subscribe to pending persistence values (consumed by the flusher).
    pub fn subscribe(&self) -> watch::Receiver<Option<i64>> {
        self.persist.subscribe()
    }
}

/// Write-behind flusher: persists each published balance until cancelled.
///
/// Should be spawned as a background task:
/// ```rust,ignore
/// tokio::spawn(run_balance_flusher(store, cache.subscribe(), shutdown.clone()));
/// ```
pub async fn run_balance_flusher(
    store: Arc<FareStore>,
    mut pending: watch::Receiver<Option<i64>>,
    shutdown: CancellationToken,
) {
    info!("Balance flusher starting");
    loop {
        tokio::select! {
            changed = pending.changed() => {
                if changed.is_err() {
                    debug!("Balance cache dropped, flusher stopping");
                    return;
                }
                let value = *pending.borrow_and_update();
                if let Some(balance) = value {
                    if let Err(e) = store.put_balance(balance) {
                        warn!(error = %e, balance, "Failed to persist balance");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                // Final flush of anything still pending
                let value = *pending.borrow_and_update();
                if let Some(balance) = value {
                    if let Err(e) = store.put_balance(balance) {
                        warn!(error = %e, balance, "Failed to persist balance on shutdown");
                    }
                }
                info!("Balance flusher shutting down");
                return;
            }
        }
    }
}
