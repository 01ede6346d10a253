// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for monapps-core.

use thiserror::Error;

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A reading already exists for one of the `(series, time)` keys in a bulk insert.
    #[error("duplicate reading in series {series_id}")]
    DuplicateReading {
        /// Datafeed or datastream id the insert targeted.
        series_id: i64,
    },

    /// A row the caller expected to exist is gone.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type name.
        entity: &'static str,
        /// Row id.
        id: i64,
    },

    /// Savepoint names are spliced into SQL, so only `[a-z_]` is accepted.
    #[error("invalid savepoint name: {0}")]
    InvalidSavepoint(String),

    /// Filesystem error while preparing a SQLite database file.
    #[error("failed to prepare database path: {0}")]
    Io(#[from] std::io::Error),

    /// Schema migration failure.
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Map a bulk-insert failure, turning unique violations into [`StoreError::DuplicateReading`].
    pub fn from_insert(err: sqlx::Error, series_id: i64) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.is_unique_violation()
        {
            return StoreError::DuplicateReading { series_id };
        }
        StoreError::Database(err)
    }

    /// Whether this is a duplicate-reading conflict.
    pub fn is_duplicate_reading(&self) -> bool {
        matches!(self, StoreError::DuplicateReading { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_not_duplicates() {
        let err = StoreError::from_insert(sqlx::Error::RowNotFound, 7);
        assert!(!err.is_duplicate_reading());
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn test_display() {
        let err = StoreError::NotFound {
            entity: "application",
            id: 3,
        };
        assert_eq!(err.to_string(), "application 3 not found");
        assert_eq!(
            StoreError::DuplicateReading { series_id: 9 }.to_string(),
            "duplicate reading in series 9"
        );
    }
}
