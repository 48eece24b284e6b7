// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Command Dispatcher
//!
//! Demultiplexes raw reader frames into logical commands and answers within
//! the reader's polling budget (low tens of milliseconds). The synchronous
//! path touches only in-memory state plus the balance cache's fast critical
//! section; signing, queue persistence, and network I/O are handed to the
//! settlement worker over a channel and never awaited here.
//!
//! Every error collapses into the fixed failure status word at this
//! boundary. Nothing propagates past it and no response is ever partial.

pub mod frame;

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::balance::{BalanceCache, Deduction};
use crate::events::{EventSink, FareEvent};
use crate::settlement::SettleJob;
use crate::storage::{DeviceIdentity, MacKey};

use frame::{failure, parse, success, Command, SELECT_ACK};

type HmacSha256 = Hmac<Sha256>;

/// Truncated MAC length in the challenge response.
const CHALLENGE_TAG_LEN: usize = 8;

/// Answers reader frames against injected collaborators.
///
/// Constructed once per device session; holds no hidden global state.
pub struct Dispatcher {
    balance: Arc<BalanceCache>,
    identity: Option<DeviceIdentity>,
    mac_keys: Vec<MacKey>,
    jobs: mpsc::UnboundedSender<SettleJob>,
    events: EventSink,
}

impl Dispatcher {
    pub fn new(
        balance: Arc<BalanceCache>,
        identity: Option<DeviceIdentity>,
        mac_keys: Vec<MacKey>,
        jobs: mpsc::UnboundedSender<SettleJob>,
        events: EventSink,
    ) -> Self {
        Self {
            balance,
            identity,
            mac_keys,
            jobs,
            events,
        }
    }

    /// Handle one command frame and return a complete response frame.
    ///
    /// Synchronous and non-blocking apart from the balance critical section;
    /// safe to call from the host's emulation callback context.
    pub fn handle(&self, raw: &[u8]) -> Vec<u8> {
        let command = match parse(raw) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, len = raw.len(), "Malformed frame");
                return failure();
            }
        };

        match command {
            Command::Select => success(SELECT_ACK),
            Command::Challenge(challenge) => self.handle_challenge(challenge),
            Command::DeductFare(fare) => self.handle_deduct(fare),
        }
    }

    /// CHALLENGE: key id (1 byte) + truncated HMAC-SHA256 tag (8 bytes) + SW.
    fn handle_challenge(&self, challenge: &[u8]) -> Vec<u8> {
        let Some(mac_key) = self.mac_keys.first() else {
            warn!("Challenge received but no MAC key provisioned");
            return failure();
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(&mac_key.key) else {
            warn!(key_id = mac_key.id, "Invalid MAC key material");
            return failure();
        };
        mac.update(challenge);
        let tag = mac.finalize().into_bytes();

        let mut body = Vec::with_capacity(1 + CHALLENGE_TAG_LEN);
        body.push(mac_key.id);
        body.extend_from_slice(&tag[..CHALLENGE_TAG_LEN]);
        success(&body)
    }

    /// DEDUCT-FARE: serialized local deduction, then deferred settlement.
    fn handle_deduct(&self, fare: u32) -> Vec<u8> {
        let Some(identity) = &self.identity else {
            warn!("Deduct received but device is not provisioned");
            self.events.emit(FareEvent::NotProvisioned);
            return failure();
        };

        match self.balance.try_deduct(fare) {
            Ok(Deduction::Ok { new_balance }) => {
                self.events.emit(FareEvent::BalanceUpdated {
                    balance: new_balance,
                });

                // Slow work (sign, persist, settle) happens off this path.
                // The worker outliving the dispatcher is a session invariant;
                // a closed channel means teardown is already underway.
                if self.jobs.send(SettleJob { fare }).is_err() {
                    warn!(fare, "Settlement worker gone, deduction recorded in balance only");
                }

                debug!(
                    device_id = %identity.device_id,
                    fare,
                    new_balance,
                    "Fare deducted"
                );
                success(&[])
            }
            Ok(Deduction::InsufficientFunds { balance }) => {
                debug!(fare, balance, "Insufficient local balance");
                self.events.emit(FareEvent::DeductionRefused { fare, balance });
                failure()
            }
            Ok(Deduction::NotProvisioned) => {
                self.events.emit(FareEvent::NotProvisioned);
                failure()
            }
            Err(e) => {
                warn!(error = %e, "Balance store read failed");
                failure()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FareStore;

    use frame::{SW_FAILURE, SW_SUCCESS};

    struct Fixture {
        dispatcher: Dispatcher,
        jobs: mpsc::UnboundedReceiver<SettleJob>,
        events: mpsc::UnboundedReceiver<FareEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture(balance: Option<i64>, provisioned: bool, mac_key: Option<MacKey>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FareStore::open(&dir.path().join("dispatch.redb")).unwrap());
        if let Some(b) = balance {
            store.put_balance(b).unwrap();
        }
        let identity = provisioned.then(|| DeviceIdentity {
            device_id: "device-1".into(),
            key_alias: "fare-key".into(),
        });
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (sink, event_rx) = EventSink::channel();
        let dispatcher = Dispatcher::new(
            Arc::new(BalanceCache::new(store)),
            identity,
            mac_key.into_iter().collect(),
            job_tx,
            sink,
        );
        Fixture {
            dispatcher,
            jobs: job_rx,
            events: event_rx,
            _dir: dir,
        }
    }

    fn deduct_frame(fare: u32) -> Vec<u8> {
        let mut f = vec![0x80, 0x10, 0x00, 0x00, 0x04];
        f.extend_from_slice(&fare.to_be_bytes());
        f
    }

    #[test]
    fn select_returns_fixed_ack() {
        let fx = fixture(Some(500), true, None);
        let response = fx.dispatcher.handle(&[0x00, 0xA4, 0x04, 0x00, 0x00]);
        assert_eq!(&response[..SELECT_ACK.len()], SELECT_ACK);
        assert_eq!(&response[response.len() - 2..], &SW_SUCCESS);
    }

    #[test]
    fn challenge_returns_key_id_and_truncated_tag() {
        let key = vec![0xA1; 16];
        let fx = fixture(Some(500), true, Some(MacKey { id: 7, key: key.clone() }));

        let challenge = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut request = vec![0x80, 0x84, 0x00, 0x00, challenge.len() as u8];
        request.extend_from_slice(&challenge);

        let response = fx.dispatcher.handle(&request);
        assert_eq!(response.len(), 1 + 8 + 2);
        assert_eq!(response[0], 7);
        assert_eq!(&response[response.len() - 2..], &SW_SUCCESS);

        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(&challenge);
        let expected = mac.finalize().into_bytes();
        assert_eq!(&response[1..9], &expected[..8]);
    }

    #[test]
    fn challenge_without_key_fails() {
        let fx = fixture(Some(500), true, None);
        let request = [0x80, 0x84, 0x00, 0x00, 0x02, 0xAA, 0xBB];
        assert_eq!(fx.dispatcher.handle(&request), SW_FAILURE.to_vec());
    }

    #[test]
    fn deduct_success_updates_balance_and_queues_job() {
        let mut fx = fixture(Some(500), true, None);

        let response = fx.dispatcher.handle(&deduct_frame(120));
        assert_eq!(response, SW_SUCCESS.to_vec());

        let job = fx.jobs.try_recv().unwrap();
        assert_eq!(job.fare, 120);
        assert_eq!(
            fx.events.try_recv().unwrap(),
            FareEvent::BalanceUpdated { balance: 380 }
        );
    }

    #[test]
    fn deduct_insufficient_funds_fails_without_job() {
        let mut fx = fixture(Some(500), true, None);

        let response = fx.dispatcher.handle(&deduct_frame(700));
        assert_eq!(response, SW_FAILURE.to_vec());
        assert!(fx.jobs.try_recv().is_err());
        assert_eq!(
            fx.events.try_recv().unwrap(),
            FareEvent::DeductionRefused { fare: 700, balance: 500 }
        );
    }

    #[test]
    fn deduct_without_identity_reports_not_provisioned() {
        let mut fx = fixture(Some(500), false, None);

        let response = fx.dispatcher.handle(&deduct_frame(10));
        assert_eq!(response, SW_FAILURE.to_vec());
        assert!(fx.jobs.try_recv().is_err());
        assert_eq!(fx.events.try_recv().unwrap(), FareEvent::NotProvisioned);
    }

    #[test]
    fn deduct_without_balance_record_reports_not_provisioned() {
        let mut fx = fixture(None, true, None);

        let response = fx.dispatcher.handle(&deduct_frame(10));
        assert_eq!(response, SW_FAILURE.to_vec());
        assert_eq!(fx.events.try_recv().unwrap(), FareEvent::NotProvisioned);
    }

    #[test]
    fn malformed_frames_fail_without_side_effects() {
        let mut fx = fixture(Some(500), true, None);

        for bad in [
            vec![],
            vec![0x80],
            vec![0x80, 0x99, 0x00, 0x00, 0x00],
            vec![0x80, 0x10, 0x00, 0x00, 0x02, 0x00, 0x78],
        ] {
            assert_eq!(fx.dispatcher.handle(&bad), SW_FAILURE.to_vec());
        }
        assert!(fx.jobs.try_recv().is_err());
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn rapid_repeated_presentations_serialize() {
        let mut fx = fixture(Some(300), true, None);

        // Three taps of 100 drain the balance; the fourth is refused
        for _ in 0..3 {
            assert_eq!(fx.dispatcher.handle(&deduct_frame(100)), SW_SUCCESS.to_vec());
        }
        assert_eq!(fx.dispatcher.handle(&deduct_frame(100)), SW_FAILURE.to_vec());

        let mut queued = 0;
        while fx.jobs.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 3);
    }
}
