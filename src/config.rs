// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration Constants
//!
//! This module defines environment variable names and default values read by
//! the host application when constructing a session. The engine itself never
//! reads the environment.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FARE_DATA_DIR` | Root directory for the device state database | `/data` |
//! | `FARE_LEDGER_URL` | Base URL of the remote ledger service | Required for settlement |
//! | `RUST_LOG` | Log level filter (host-installed subscriber) | `info` |

/// Environment variable name for the device state directory.
///
/// The directory is expected to sit on an at-rest encrypted mount (platform
/// keystore backed). The engine performs standard filesystem I/O only and
/// implements no storage cryptography of its own.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "FARE_DATA_DIR";

/// Default device state directory when `FARE_DATA_DIR` is unset.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Environment variable name for the remote ledger base URL.
///
/// The sync engine posts signed transactions to `{base}/redeem`.
pub const LEDGER_URL_ENV: &str = "FARE_LEDGER_URL";

/// File name of the device state database inside the data directory.
pub const STATE_DB_FILE: &str = "fare_state.redb";
