// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-series points and range filters.

use serde::{Deserialize, Serialize};

/// A single point of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    /// Epoch milliseconds, unique within the series.
    pub time: i64,
    /// Measured or computed value. No-data markers carry `0.0`.
    pub value: f64,
    /// The value was filled in rather than measured.
    #[serde(default)]
    pub restored: bool,
}

impl Reading {
    /// Measured point.
    pub fn new(time: i64, value: f64) -> Self {
        Self {
            time,
            value,
            restored: false,
        }
    }
}

/// Classification of a datastream reading. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    /// Accepted measurement.
    Valid,
    /// Rejected by validation.
    Invalid,
    /// Received while the channel was disabled.
    Unused,
    /// Rejected by the rate-of-change check.
    NonRoc,
    /// Marks a gap in the data.
    NoDataMarker,
    /// Gap marker received while the channel was disabled.
    UnusedNoDataMarker,
}

impl ReadingKind {
    /// Every kind.
    pub const ALL: [ReadingKind; 6] = [
        ReadingKind::Valid,
        ReadingKind::Invalid,
        ReadingKind::Unused,
        ReadingKind::NonRoc,
        ReadingKind::NoDataMarker,
        ReadingKind::UnusedNoDataMarker,
    ];

    /// Backing table.
    pub const fn table(self) -> &'static str {
        match self {
            ReadingKind::Valid => "ds_readings",
            ReadingKind::Invalid => "invalid_ds_readings",
            ReadingKind::Unused => "unused_ds_readings",
            ReadingKind::NonRoc => "nonroc_ds_readings",
            ReadingKind::NoDataMarker => "nd_markers",
            ReadingKind::UnusedNoDataMarker => "unused_nd_markers",
        }
    }
}

/// Time filter over a series. `gte` wins over `gt` when both are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingRange {
    /// Strictly after.
    pub gt: Option<i64>,
    /// At or after.
    pub gte: Option<i64>,
    /// At or before.
    pub lte: Option<i64>,
    /// Maximum number of rows, oldest first.
    pub limit: Option<i64>,
}

impl ReadingRange {
    /// Everything strictly after `ts`.
    pub fn after(ts: i64) -> Self {
        Self {
            gt: Some(ts),
            ..Self::default()
        }
    }

    /// Cap the number of rows.
    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Lower bound as `(ts, inclusive)`.
    pub fn lower_bound(&self) -> Option<(i64, bool)> {
        match (self.gte, self.gt) {
            (Some(gte), _) => Some((gte, true)),
            (None, Some(gt)) => Some((gt, false)),
            (None, None) => None,
        }
    }

    /// Whether `ts` passes the filter, ignoring `limit`.
    pub fn contains(&self, ts: i64) -> bool {
        let lower_ok = match self.lower_bound() {
            Some((bound, true)) => ts >= bound,
            Some((bound, false)) => ts > bound,
            None => true,
        };
        lower_ok && self.lte.is_none_or(|lte| ts <= lte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gte_takes_precedence_over_gt() {
        let range = ReadingRange {
            gt: Some(100),
            gte: Some(50),
            ..ReadingRange::default()
        };
        assert_eq!(range.lower_bound(), Some((50, true)));
        assert!(range.contains(50));
        assert!(!range.contains(49));
    }

    #[test]
    fn test_range_bounds() {
        let range = ReadingRange {
            lte: Some(20),
            ..ReadingRange::after(10)
        };
        assert!(!range.contains(10));
        assert!(range.contains(11));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(ReadingRange::default().contains(i64::MIN));
    }

    #[test]
    fn test_kind_tables_are_distinct() {
        let mut tables: Vec<_> = ReadingKind::ALL.iter().map(|k| k.table()).collect();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), ReadingKind::ALL.len());
    }
}
