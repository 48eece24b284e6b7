// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable FIFO queue of signed transactions awaiting settlement.
//!
//! Entries are independent by `tx_id`; strict ordering is not required for
//! correctness but FIFO is kept for fairness. An entry leaves the queue only
//! on confirmed settlement or confirmed terminal rejection.
//!
//! `drain` operates on a point-in-time snapshot: transactions enqueued while
//! a drain is in flight are untouched and become visible to the next pass.

use std::sync::Arc;

use crate::signer::SignedTransaction;

use super::{FareStore, StoreResult};

/// What a drain visitor decided for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retryable: keep the entry for the next pass.
    Keep,
    /// Confirmed settlement: remove.
    Settled,
    /// Confirmed terminal rejection: remove.
    Terminal,
}

/// Durable ordered collection of unsettled transactions.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<FareStore>,
}

impl OfflineQueue {
    pub fn new(store: Arc<FareStore>) -> Self {
        Self { store }
    }

    /// Durably append a transaction.
    pub fn enqueue(&self, tx: &SignedTransaction) -> StoreResult<()> {
        let bytes = serde_json::to_vec(tx)?;
        let seq = self.store.queue_append(&bytes)?;
        tracing::debug!(tx_id = %tx.tx_id, seq, "Transaction queued");
        Ok(())
    }

    /// Snapshot of all queued transactions in FIFO order.
    pub fn entries(&self) -> StoreResult<Vec<SignedTransaction>> {
        let mut txs = Vec::new();
        for (_, bytes) in self.store.queue_scan()? {
            txs.push(serde_json::from_slice(&bytes)?);
        }
        Ok(txs)
    }

    /// Persist an updated copy of an entry (matched by `tx_id`).
    ///
    /// Used when an unsigned placeholder is re-signed before submission.
    pub fn update(&self, tx: &SignedTransaction) -> StoreResult<()> {
        for (seq, bytes) in self.store.queue_scan()? {
            let stored: SignedTransaction = serde_json::from_slice(&bytes)?;
            if stored.tx_id == tx.tx_id {
                self.store.queue_replace(seq, &serde_json::to_vec(tx)?)?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Visit each entry in a snapshot and apply the visitor's disposition.
    ///
    /// Returns the number of entries remaining afterwards (including any that
    /// were enqueued concurrently).
    pub fn drain<F>(&self, mut visit: F) -> StoreResult<usize>
    where
        F: FnMut(&SignedTransaction) -> Disposition,
    {
        let snapshot = self.store.queue_scan()?;
        let mut removals = Vec::new();

        for (seq, bytes) in &snapshot {
            let tx: SignedTransaction = serde_json::from_slice(bytes)?;
            match visit(&tx) {
                Disposition::Keep => {}
                Disposition::Settled | Disposition::Terminal => removals.push(*seq),
            }
        }

        self.store.queue_remove(&removals)?;
        self.store.queue_len()
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> StoreResult<usize> {
        self.store.queue_len()
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.store.queue_len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_queue() -> (OfflineQueue, Arc<FareStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FareStore::open(&dir.path().join("queue.redb")).unwrap());
        (OfflineQueue::new(store.clone()), store, dir)
    }

    #[test]
    fn enqueue_preserves_fifo_order() {
        let (queue, _store, _dir) = temp_queue();
        let first = SignedTransaction::build(100);
        let second = SignedTransaction::build(200);
        queue.enqueue(&first).unwrap();
        queue.enqueue(&second).unwrap();

        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tx_id, first.tx_id);
        assert_eq!(entries[1].tx_id, second.tx_id);
    }

    #[test]
    fn drain_applies_dispositions() {
        let (queue, _store, _dir) = temp_queue();
        let keep = SignedTransaction::build(1);
        let settle = SignedTransaction::build(2);
        let reject = SignedTransaction::build(3);
        for tx in [&keep, &settle, &reject] {
            queue.enqueue(tx).unwrap();
        }

        let remaining = queue
            .drain(|tx| {
                if tx.tx_id == settle.tx_id {
                    Disposition::Settled
                } else if tx.tx_id == reject.tx_id {
                    Disposition::Terminal
                } else {
                    Disposition::Keep
                }
            })
            .unwrap();

        assert_eq!(remaining, 1);
        let entries = queue.entries().unwrap();
        assert_eq!(entries[0].tx_id, keep.tx_id);
    }

    #[test]
    fn enqueue_during_drain_is_visible_to_next_pass() {
        let (queue, _store, _dir) = temp_queue();
        queue.enqueue(&SignedTransaction::build(10)).unwrap();

        let late = SignedTransaction::build(20);
        let late_ref = &late;
        let queue_ref = queue.clone();
        let remaining = queue
            .drain(|_| {
                // Concurrent enqueue while the snapshot is being visited
                queue_ref.enqueue(late_ref).unwrap();
                Disposition::Settled
            })
            .unwrap();

        // The snapshot entry settled; the concurrent one remains
        assert_eq!(remaining, 1);
        let entries = queue.entries().unwrap();
        assert_eq!(entries[0].tx_id, late.tx_id);
    }

    #[test]
    fn update_replaces_placeholder_signature() {
        let (queue, _store, _dir) = temp_queue();
        let mut tx = SignedTransaction::build(50);
        queue.enqueue(&tx).unwrap();
        assert!(!queue.entries().unwrap()[0].is_signed());

        tx.signature = Some(vec![0xAB; 64]);
        queue.update(&tx).unwrap();

        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].signature, Some(vec![0xAB; 64]));
    }

    #[test]
    fn queue_is_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.redb");
        let tx = SignedTransaction::build(77);
        {
            let store = Arc::new(FareStore::open(&path).unwrap());
            OfflineQueue::new(store).enqueue(&tx).unwrap();
        }
        let store = Arc::new(FareStore::open(&path).unwrap());
        let queue = OfflineQueue::new(store);
        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tx_id, tx.tx_id);
        assert_eq!(entries[0].amount, 77);
    }
}
