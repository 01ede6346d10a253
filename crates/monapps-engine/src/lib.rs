// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monapps Engine - health, status and current-state rollup
//!
//! This crate keeps the aggregated signals of a monitored asset tree current
//! with as little recomputation as possible. Changes flow bottom-up; each
//! tier only recomputes what a child explicitly marked dirty.
//!
//! # Architecture
//!
//! ```text
//!  raw device messages                        application schedules
//!          │                                           │
//!          ▼                                           ▼
//! ┌─────────────────┐                       ┌─────────────────────┐
//! │ RawDataProcessor│                       │    AppScheduler     │
//! │  readings, e/w  │                       │  AppFuncExecutor    │
//! └────────┬────────┘                       └──────────┬──────────┘
//!          │ lastReadingTs, msgHealth                  │ status, currState,
//!          ▼                                           │ health
//! ┌─────────────────┐   health changed    ┌────────────┴────────┐
//! │ DsHealthUpdater │───────────────────▶ │    DeviceUpdater    │
//! │  no-data health │   mark device       │ max(msg, children)  │
//! └─────────────────┘                     └────────────┬────────┘
//!                                                      │ mark asset (debounced)
//!                                                      ▼
//!                                         ┌─────────────────────┐
//!                                         │    AssetUpdater     │──┐ mark parent
//!                                         │ children-first      │◀─┘
//!                                         └──────────┬──────────┘
//!                                                    │ after commit
//!                                                    ▼
//!                                         ┌─────────────────────┐
//!                                         │   ChangeNotifier    │
//!                                         └─────────────────────┘
//! ```
//!
//! # Dirty marks
//!
//! A mark records which rollup fields (`status`, `currState`, `health`) a
//! parent must re-evaluate plus a due time `now + TIME_ASSET_UPD * coef`.
//! Marks on an already-dirty row union the field set and keep the earlier
//! due time, so a burst of child changes costs one recompute.
//!
//! # Configuration
//!
//! Loaded from `MONAPPS_*` environment variables, see [`config::Config`].
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types
//! - [`scheduler`]: Dirty marks and debounce
//! - [`health`]: Health and staleness rules
//! - [`publisher`]: Change publication
//! - [`alarm_log`]: Alarm log and alarm map merging
//! - [`app_function`]: Pluggable application functions
//! - [`app_executor`]: Per-application execution pipeline
//! - [`app_scheduler`]: Periodic application invocation
//! - [`ds_health_updater`], [`device_updater`], [`asset_updater`]: tier sweeps
//! - [`ingest`]: Raw device message ingestion
//! - [`lifecycle`]: Creating, deleting and enabling hierarchy members
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

pub mod scheduler;

pub mod health;

/// Change publication after commit.
pub mod publisher;

pub mod alarm_log;

/// Pluggable application functions and their registry.
pub mod app_function;

pub mod app_executor;

pub mod app_scheduler;

/// Shared job dependencies.
pub mod context;

pub mod ds_health_updater;

pub mod device_updater;

pub mod asset_updater;

pub mod ingest;

pub mod lifecycle;

/// Embeddable runtime for the engine.
pub mod runtime;

pub use config::Config;
pub use context::JobContext;
pub use error::{Error, Result};
pub use runtime::EngineRuntime;
