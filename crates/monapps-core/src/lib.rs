// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monapps Core - entities, change tracking and persistence
//!
//! This crate holds everything the rollup engine needs to talk about the
//! monitored hierarchy without knowing how it is scheduled:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Asset                               │
//! │   status / currState / health rolled up from its children    │
//! └──────────────────────────────────────────────────────────────┘
//!        │                    │                        │
//!        ▼                    ▼                        ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  Application │   │      Device      │   │   child Asset    │
//! │  (function + │   │  msgHealth,      │   │   (recursive)    │
//! │   datafeeds) │   │  chldHealth      │   └──────────────────┘
//! └──────────────┘   └──────────────────┘
//!        │                    │
//!        ▼                    ▼
//! ┌──────────────┐   ┌──────────────────┐
//! │   Datafeed   │──▶│    Datastream    │
//! │  (readings)  │   │  (ndHealth)      │
//! └──────────────┘   └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`model`] | Health grades, rollup field sets, [`model::Tracked`] change tracking, entity rows |
//! | [`clock`] | Injectable millisecond clock |
//! | [`persistence`] | [`persistence::Store`] / [`persistence::StoreTx`] with Postgres and SQLite backends |
//! | [`migrations`] | Embedded schema migrations |
//! | [`error`] | [`error::StoreError`] |
//!
//! # Timestamps
//!
//! Every timestamp is an `i64` count of milliseconds since the Unix epoch.
//! "Nothing pending" is expressed with [`model::MAX_TS_MS`] rather than NULL so
//! that due-time queries stay a single indexed comparison.

#![deny(missing_docs)]

pub mod clock;
pub mod error;
pub mod migrations;
pub mod model;
pub mod persistence;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use persistence::{Store, StoreTx};
