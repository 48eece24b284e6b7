// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outbound event channel to the external UI layer.
//!
//! The core reports background outcomes (balance changes, queued and settled
//! transactions, refusals) over a one-way channel. Delivery is at-most-once
//! and the core never blocks on it: if no subscriber is attached the event is
//! dropped with a debug log.

use serde::Serialize;
use tokio::sync::mpsc;

/// Notification emitted by the engine for the UI layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FareEvent {
    /// The locally cached balance changed (deduction or reconciliation).
    BalanceUpdated { balance: i64 },

    /// A deduction was refused because the fare exceeds the balance.
    DeductionRefused { fare: u32, balance: i64 },

    /// No device identity or balance is provisioned; external provisioning
    /// must run before fares can be deducted.
    NotProvisioned,

    /// A transaction was durably queued for settlement.
    TransactionQueued { tx_id: String },

    /// Signing failed after the deduction committed; the transaction was
    /// queued unsigned and will be re-signed before submission.
    SigningDegraded { tx_id: String },

    /// The remote ledger settled a queued transaction.
    TransactionSettled { tx_id: String, new_balance: i64 },

    /// The remote ledger terminally rejected a queued transaction.
    TransactionRejected { tx_id: String, reason: String },
}

/// Cloneable, non-blocking sender half of the event channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<FareEvent>,
}

impl EventSink {
    /// Create a sink together with its subscriber half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FareEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. Never blocks; silently drops when no subscriber.
    pub fn emit(&self, event: FareEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event dropped: no subscriber attached");
        }
    }
}
