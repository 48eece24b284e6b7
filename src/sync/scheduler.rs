// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Background drive loop for the sync engine.
//!
//! Drain passes are triggered three ways: a fixed poll interval, an explicit
//! nudge from [`SyncTrigger`] (fired right after a transaction is queued),
//! and engine backoff after a failed pass. The scheduler owns none of the
//! drain logic; it only decides *when* the engine runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ledger::LedgerClient;
use super::SyncEngine;

/// Default interval between unprompted drain passes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Handle for requesting an immediate drain pass.
///
/// Cheap to clone and safe to fire from any context; a nudge while a pass is
/// already running coalesces into at most one follow-up pass.
#[derive(Clone)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    /// Request a drain pass as soon as the scheduler is listening.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// A trigger wired to nothing. Used when the device is not provisioned
    /// and no scheduler is running.
    pub fn detached() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Runs the sync engine on a timer, on demand, and under backoff.
pub struct SyncScheduler<L> {
    engine: Arc<SyncEngine<L>>,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl<L: LedgerClient> SyncScheduler<L> {
    pub fn new(engine: Arc<SyncEngine<L>>, poll_interval: Duration) -> (Self, SyncTrigger) {
        let notify = Arc::new(Notify::new());
        let trigger = SyncTrigger {
            notify: notify.clone(),
        };
        (
            Self {
                engine,
                notify,
                poll_interval,
            },
            trigger,
        )
    }

    /// Drive drain passes until cancelled.
    ///
    /// After each pass the next delay is the engine's backoff when the pass
    /// failed, the poll interval otherwise. An explicit trigger cuts either
    /// delay short.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(poll_interval = ?self.poll_interval, "Sync scheduler starting");

        loop {
            let summary = self.engine.run_pass().await;
            let delay = match self.engine.retry_backoff() {
                Some(backoff) => {
                    debug!(kept = summary.kept, delay = ?backoff, "Backing off after failed pass");
                    backoff
                }
                None => self.poll_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.notify.notified() => {
                    debug!("Drain pass requested");
                }
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    return;
                }
            }
        }
    }
}
