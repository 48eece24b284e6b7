// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Fare Engine - Offline-First Contactless Fare Deduction
//!
//! This crate answers proximity-reader command frames within the reader's
//! polling budget, deducts fares from a locally cached balance under a
//! serialized mutation discipline, produces signed offline transaction
//! receipts, and settles them against the remote ledger through a durable
//! retry queue.
//!
//! ## Modules
//!
//! - `protocol` - Reader frame parsing and the command dispatcher
//! - `balance` - Serialized local balance cache with write-behind persistence
//! - `signer` - Canonical payload construction and the signing capability
//! - `storage` - Durable device state (redb) including the offline queue
//! - `sync` - Settlement engine, remote ledger client, and scheduler
//! - `settlement` - Background worker deferring slow work off the reader path
//! - `events` - Non-blocking outbound notifications to the UI layer
//! - `session` - Explicit wiring and lifecycle of a device session

pub mod balance;
pub mod config;
pub mod events;
pub mod protocol;
pub mod session;
pub mod settlement;
pub mod signer;
pub mod storage;
pub mod sync;
