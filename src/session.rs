// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Fare Session
//!
//! Composition root: wires the store, balance cache, dispatcher, settlement
//! worker, sync scheduler, and event channel into one running engine.
//!
//! ## Strategy
//!
//! A session is started once per host lifecycle. Background tasks (balance
//! flusher, settlement worker, sync scheduler) are spawned here and share a
//! single cancellation token; [`FareSession::shutdown`] flushes pending state
//! and stops them.
//!
//! An unprovisioned device still gets a working session: the dispatcher
//! answers SELECT and reports `NotProvisioned` for deductions, but no
//! settlement worker or scheduler is spawned until identity exists.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balance::{run_balance_flusher, BalanceCache};
use crate::events::{EventSink, FareEvent};
use crate::protocol::Dispatcher;
use crate::settlement::{SettleJob, SettlementWorker};
use crate::signer::TransactionSigner;
use crate::storage::{FareStore, OfflineQueue, StoreResult};
use crate::sync::ledger::LedgerClient;
use crate::sync::scheduler::{SyncScheduler, SyncTrigger, DEFAULT_SYNC_INTERVAL};
use crate::sync::SyncEngine;

/// A running fare engine bound to one device store.
pub struct FareSession {
    dispatcher: Dispatcher,
    balance: Arc<BalanceCache>,
    trigger: SyncTrigger,
    shutdown: CancellationToken,
}

impl FareSession {
    /// Load device state and spawn the background tasks.
    ///
    /// Returns the session plus the event receiver for the UI layer. Must be
    /// called inside a tokio runtime.
    pub fn start<L: LedgerClient>(
        store: Arc<FareStore>,
        signer: Arc<dyn TransactionSigner>,
        ledger: L,
    ) -> StoreResult<(Self, mpsc::UnboundedReceiver<FareEvent>)> {
        let identity = store.identity()?;
        let mac_keys = store.mac_keys()?;
        let (events, event_rx) = EventSink::channel();
        let balance = Arc::new(BalanceCache::new(store.clone()));
        let queue = OfflineQueue::new(store.clone());
        let shutdown = CancellationToken::new();

        tokio::spawn(run_balance_flusher(
            store,
            balance.subscribe(),
            shutdown.clone(),
        ));

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<SettleJob>();

        let trigger = match &identity {
            Some(identity) => {
                let engine = Arc::new(SyncEngine::new(
                    queue.clone(),
                    balance.clone(),
                    signer.clone(),
                    ledger,
                    identity.clone(),
                    events.clone(),
                ));
                let (scheduler, trigger) =
                    SyncScheduler::new(engine, DEFAULT_SYNC_INTERVAL);
                tokio::spawn(scheduler.run(shutdown.clone()));

                let worker = SettlementWorker::new(
                    signer,
                    queue,
                    identity.clone(),
                    events.clone(),
                    trigger.clone(),
                );
                tokio::spawn(worker.run(jobs_rx, shutdown.clone()));

                info!(device_id = %identity.device_id, "Fare session started");
                trigger
            }
            None => {
                warn!("Fare session started without provisioned identity");
                SyncTrigger::detached()
            }
        };

        let dispatcher = Dispatcher::new(balance.clone(), identity, mac_keys, jobs_tx, events);

        Ok((
            Self {
                dispatcher,
                balance,
                trigger,
                shutdown,
            },
            event_rx,
        ))
    }

    /// Handle one reader frame. Synchronous; see [`Dispatcher::handle`].
    pub fn handle(&self, frame: &[u8]) -> Vec<u8> {
        self.dispatcher.handle(frame)
    }

    /// Request an immediate drain pass (connectivity regained, app resumed).
    pub fn trigger_sync(&self) {
        self.trigger.trigger();
    }

    /// Current cached balance, `None` before the first load.
    pub fn balance(&self) -> Option<i64> {
        self.balance.current()
    }

    /// Stop background tasks and drop the cached balance.
    ///
    /// The flusher persists any pending balance before exiting; queued
    /// transactions stay durable and are drained by the next session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.balance.invalidate();
        info!("Fare session shut down");
    }
}
