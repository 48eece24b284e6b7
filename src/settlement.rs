// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deferred settlement of committed deductions.
//!
//! The dispatcher answers the reader from memory and hands the slow half of a
//! deduction (sign, persist, nudge the sync loop) to this worker over an
//! unbounded channel. By the time a job arrives the balance change is already
//! committed; everything here is about never losing the receipt for it.
//!
//! A signing failure does not block the queue: the transaction is persisted
//! as an unsigned placeholder and re-signed by the sync engine before
//! submission.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventSink, FareEvent};
use crate::signer::{SignedTransaction, TransactionSigner};
use crate::storage::{DeviceIdentity, OfflineQueue};
use crate::sync::scheduler::SyncTrigger;

/// One committed deduction awaiting signing and queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleJob {
    /// Deducted fare in minor units.
    pub fare: u32,
}

/// Signs and durably queues deductions handed off by the dispatcher.
pub struct SettlementWorker {
    signer: Arc<dyn TransactionSigner>,
    queue: OfflineQueue,
    identity: DeviceIdentity,
    events: EventSink,
    sync: SyncTrigger,
}

impl SettlementWorker {
    pub fn new(
        signer: Arc<dyn TransactionSigner>,
        queue: OfflineQueue,
        identity: DeviceIdentity,
        events: EventSink,
        sync: SyncTrigger,
    ) -> Self {
        Self {
            signer,
            queue,
            identity,
            events,
            sync,
        }
    }

    /// Consume jobs until the channel closes or shutdown is requested.
    pub async fn run(self, mut jobs: mpsc::UnboundedReceiver<SettleJob>, shutdown: CancellationToken) {
        info!("Settlement worker starting");
        loop {
            tokio::select! {
                job = jobs.recv() => {
                    match job {
                        Some(job) => self.process(job),
                        None => {
                            debug!("Dispatcher gone, settlement worker stopping");
                            return;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    // Drain anything already handed off before stopping
                    while let Ok(job) = jobs.try_recv() {
                        self.process(job);
                    }
                    info!("Settlement worker shutting down");
                    return;
                }
            }
        }
    }

    /// Build, sign, and durably queue one transaction, then nudge sync.
    pub fn process(&self, job: SettleJob) {
        let mut tx = SignedTransaction::build(i64::from(job.fare));

        match self.signer.sign(&self.identity.key_alias, &tx.payload) {
            Ok(signature) => tx.signature = Some(signature),
            Err(e) => {
                // The deduction is already committed; queue unsigned and let
                // the sync engine re-sign before submission.
                warn!(tx_id = %tx.tx_id, error = %e, "Signing failed, queueing unsigned placeholder");
                self.events.emit(FareEvent::SigningDegraded {
                    tx_id: tx.tx_id.clone(),
                });
            }
        }

        if let Err(e) = self.queue.enqueue(&tx) {
            // Deduction applied but its receipt could not be persisted.
            error!(tx_id = %tx.tx_id, fare = job.fare, error = %e, "Failed to queue transaction");
            return;
        }

        debug!(tx_id = %tx.tx_id, fare = job.fare, signed = tx.is_signed(), "Transaction queued");
        self.events.emit(FareEvent::TransactionQueued {
            tx_id: tx.tx_id.clone(),
        });
        self.sync.trigger();
    }
}
