// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Durable Device State
//!
//! Single embedded redb database (pure Rust, ACID) holding everything the
//! engine must survive a restart with.
//!
//! ## Table Layout
//!
//! - `balance`: "balance" → i64 minor units
//! - `device`: "identity" → serialized DeviceIdentity (JSON bytes)
//! - `mac_keys`: key id (u8) → raw symmetric key bytes
//! - `offline_queue`: sequence (u64) → serialized SignedTransaction
//! - `queue_state`: "next_seq" → next queue sequence number
//!
//! ## At-Rest Encryption
//!
//! The database file lives on the platform's encrypted mount (keystore-backed
//! filesystem). This module uses **normal filesystem I/O**; confidentiality
//! and integrity of the file at rest are the platform's responsibility.
//! DO NOT implement storage crypto in this module.

pub mod queue;

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

pub use queue::{Disposition, OfflineQueue};

// =============================================================================
// Table Definitions
// =============================================================================

/// Balance table: "balance" → minor-unit amount.
const BALANCE: TableDefinition<&str, i64> = TableDefinition::new("balance");

/// Device table: "identity" → serialized DeviceIdentity (JSON bytes).
const DEVICE: TableDefinition<&str, &[u8]> = TableDefinition::new("device");

/// Challenge-response keys: one-byte key id → raw symmetric key.
const MAC_KEYS: TableDefinition<u8, &[u8]> = TableDefinition::new("mac_keys");

/// Offline queue: monotonically increasing sequence → serialized transaction.
const QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("offline_queue");

/// Queue bookkeeping: "next_seq" → next sequence number to assign.
const QUEUE_STATE: TableDefinition<&str, u64> = TableDefinition::new("queue_state");

const BALANCE_KEY: &str = "balance";
const IDENTITY_KEY: &str = "identity";
const NEXT_SEQ_KEY: &str = "next_seq";

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Provisioned Records
// =============================================================================

/// Provisioned device identity. Written once by the external onboarding flow,
/// read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable identifier the remote ledger knows this device by.
    pub device_id: String,
    /// Handle of the signing key inside the tamper-resistant key store.
    pub key_alias: String,
}

/// Pre-shared symmetric key for reader challenge-response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacKey {
    pub id: u8,
    pub key: Vec<u8>,
}

// =============================================================================
// FareStore
// =============================================================================

/// Embedded ACID store for all durable device state.
pub struct FareStore {
    db: Database,
}

impl FareStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BALANCE)?;
            let _ = write_txn.open_table(DEVICE)?;
            let _ = write_txn.open_table(MAC_KEYS)?;
            let _ = write_txn.open_table(QUEUE)?;
            let _ = write_txn.open_table(QUEUE_STATE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Balance
    // =========================================================================

    /// Read the persisted balance, `None` when never provisioned.
    pub fn balance(&self) -> StoreResult<Option<i64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BALANCE)?;
        Ok(table.get(BALANCE_KEY)?.map(|v| v.value()))
    }

    /// Persist the balance (provisioning top-up or write-behind flush).
    pub fn put_balance(&self, amount: i64) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BALANCE)?;
            table.insert(BALANCE_KEY, amount)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Device identity
    // =========================================================================

    /// Read the provisioned identity, `None` when never provisioned.
    pub fn identity(&self) -> StoreResult<Option<DeviceIdentity>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICE)?;
        match table.get(IDENTITY_KEY)? {
            Some(value) => {
                let identity: DeviceIdentity = serde_json::from_slice(value.value())?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }

    /// Provision the device identity (external onboarding flow).
    pub fn put_identity(&self, identity: &DeviceIdentity) -> StoreResult<()> {
        let json = serde_json::to_vec(identity)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEVICE)?;
            table.insert(IDENTITY_KEY, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Challenge-response keys
    // =========================================================================

    /// List provisioned MAC keys, ascending by key id.
    pub fn mac_keys(&self) -> StoreResult<Vec<MacKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MAC_KEYS)?;
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (id, key) = entry?;
            keys.push(MacKey {
                id: id.value(),
                key: key.value().to_vec(),
            });
        }
        Ok(keys)
    }

    /// Provision (or replace) a challenge-response key.
    pub fn put_mac_key(&self, id: u8, key: &[u8]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MAC_KEYS)?;
            table.insert(id, key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Queue primitives (consumed by storage::queue::OfflineQueue)
    // =========================================================================

    /// Append serialized bytes to the queue, returning the assigned sequence.
    pub(crate) fn queue_append(&self, bytes: &[u8]) -> StoreResult<u64> {
        let write_txn = self.db.begin_write()?;
        let seq;
        {
            let mut state = write_txn.open_table(QUEUE_STATE)?;
            seq = state.get(NEXT_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
            state.insert(NEXT_SEQ_KEY, seq + 1)?;

            let mut queue = write_txn.open_table(QUEUE)?;
            queue.insert(seq, bytes)?;
        }
        write_txn.commit()?;
        Ok(seq)
    }

    /// Snapshot all queue entries in FIFO order.
    pub(crate) fn queue_scan(&self) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUE)?;
        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (seq, bytes) = entry?;
            entries.push((seq.value(), bytes.value().to_vec()));
        }
        Ok(entries)
    }

    /// Replace the bytes stored at an existing sequence.
    pub(crate) fn queue_replace(&self, seq: u64, bytes: &[u8]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(QUEUE)?;
            table.insert(seq, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove the given sequences in one transaction.
    pub(crate) fn queue_remove(&self, seqs: &[u64]) -> StoreResult<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(QUEUE)?;
            for seq in seqs {
                table.remove(*seq)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Number of entries currently queued.
    pub(crate) fn queue_len(&self) -> StoreResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUE)?;
        Ok(table.len()? as usize)
    }
}
