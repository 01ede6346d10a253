// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for monapps-engine.

use monapps_core::StoreError;
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The application function failed or returned an unusable result.
    #[error("Application function error: {0}")]
    AppFunc(#[from] crate::app_function::AppFuncError),

    /// A raw data message could not be parsed.
    #[error("Ingestion error: {0}")]
    Ingest(#[from] crate::ingest::IngestError),

    /// A blocking task could not be joined.
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Entity was not found.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type name.
        entity: &'static str,
        /// Entity id.
        id: i64,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error is a rejected rewrite of existing derived readings.
    pub fn is_duplicate_reading(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_duplicate_reading())
    }
}

/// Result type using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
