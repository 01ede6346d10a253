// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health grades and rollup field sets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity grade. Ordering is `Undefined < Ok < Warning < Error`, so
/// aggregation is always `max`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum HealthGrade {
    /// No information yet.
    #[default]
    Undefined = 0,
    /// Healthy.
    Ok = 1,
    /// Degraded.
    Warning = 2,
    /// Failing.
    Error = 3,
}

impl HealthGrade {
    /// Worst grade of `grades`, `Undefined` when empty.
    pub fn worst(grades: impl IntoIterator<Item = HealthGrade>) -> HealthGrade {
        grades
            .into_iter()
            .fold(HealthGrade::Undefined, std::cmp::Ord::max)
    }

    /// Upper-case label used in the alarm log.
    pub fn as_str(self) -> &'static str {
        match self {
            HealthGrade::Undefined => "UNDEFINED",
            HealthGrade::Ok => "OK",
            HealthGrade::Warning => "WARNING",
            HealthGrade::Error => "ERROR",
        }
    }
}

impl fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<HealthGrade> for i32 {
    fn from(grade: HealthGrade) -> i32 {
        grade as i32
    }
}

/// Integer outside the known grade range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid health grade: {0}")]
pub struct InvalidHealthGrade(pub i32);

impl TryFrom<i32> for HealthGrade {
    type Error = InvalidHealthGrade;

    fn try_from(value: i32) -> Result<Self, InvalidHealthGrade> {
        match value {
            0 => Ok(HealthGrade::Undefined),
            1 => Ok(HealthGrade::Ok),
            2 => Ok(HealthGrade::Warning),
            3 => Ok(HealthGrade::Error),
            other => Err(InvalidHealthGrade(other)),
        }
    }
}

/// A field a parent can be asked to recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RollupField {
    /// Aggregated status.
    Status,
    /// Aggregated current state.
    CurrState,
    /// Aggregated health.
    Health,
}

impl RollupField {
    /// All rollup fields in recompute order.
    pub const ALL: [RollupField; 3] = [
        RollupField::Status,
        RollupField::CurrState,
        RollupField::Health,
    ];

    const fn bit(self) -> i32 {
        match self {
            RollupField::Status => 1,
            RollupField::CurrState => 1 << 1,
            RollupField::Health => 1 << 2,
        }
    }
}

/// Set of [`RollupField`]s pending recomputation, stored as a bitmask column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct ReevalFields(i32);

impl ReevalFields {
    /// Nothing pending.
    pub const NONE: ReevalFields = ReevalFields(0);
    /// Every rollup field pending.
    pub const ALL: ReevalFields = ReevalFields(0b111);

    /// Set holding a single field.
    pub const fn of(field: RollupField) -> Self {
        ReevalFields(field.bit())
    }

    /// Rebuild from a stored bitmask, dropping unknown bits.
    pub const fn from_bits(bits: i32) -> Self {
        ReevalFields(bits & Self::ALL.0)
    }

    /// Raw bitmask.
    pub const fn bits(self) -> i32 {
        self.0
    }

    /// True when nothing is pending.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Membership test.
    pub const fn contains(self, field: RollupField) -> bool {
        self.0 & field.bit() != 0
    }

    /// Add a field.
    pub fn insert(&mut self, field: RollupField) {
        self.0 |= field.bit();
    }

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: ReevalFields) -> Self {
        ReevalFields(self.0 | other.0)
    }

    /// Pending fields in recompute order.
    pub fn iter(self) -> impl Iterator<Item = RollupField> {
        RollupField::ALL
            .into_iter()
            .filter(move |field| self.contains(*field))
    }
}

impl FromIterator<RollupField> for ReevalFields {
    fn from_iter<I: IntoIterator<Item = RollupField>>(iter: I) -> Self {
        let mut set = ReevalFields::NONE;
        for field in iter {
            set.insert(field);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRADES: [HealthGrade; 4] = [
        HealthGrade::Undefined,
        HealthGrade::Ok,
        HealthGrade::Warning,
        HealthGrade::Error,
    ];

    #[test]
    fn test_grade_ordering() {
        assert!(HealthGrade::Undefined < HealthGrade::Ok);
        assert!(HealthGrade::Ok < HealthGrade::Warning);
        assert!(HealthGrade::Warning < HealthGrade::Error);
    }

    #[test]
    fn test_worst_is_max_for_all_pairs() {
        for a in GRADES {
            for b in GRADES {
                let expected = if a >= b { a } else { b };
                assert_eq!(HealthGrade::worst([a, b]), expected, "{a} vs {b}");
            }
        }
        assert_eq!(HealthGrade::worst([]), HealthGrade::Undefined);
    }

    #[test]
    fn test_grade_serde_as_integer() {
        assert_eq!(serde_json::to_value(HealthGrade::Warning).unwrap(), 2);
        let grade: HealthGrade = serde_json::from_value(serde_json::json!(3)).unwrap();
        assert_eq!(grade, HealthGrade::Error);
        assert!(serde_json::from_value::<HealthGrade>(serde_json::json!(7)).is_err());
    }

    #[test]
    fn test_grade_try_from_integer() {
        for grade in GRADES {
            assert_eq!(HealthGrade::try_from(i32::from(grade)), Ok(grade));
        }
        assert_eq!(HealthGrade::try_from(-1), Err(InvalidHealthGrade(-1)));
    }

    #[test]
    fn test_reeval_fields_set_ops() {
        let mut set = ReevalFields::NONE;
        assert!(set.is_empty());

        set.insert(RollupField::Health);
        assert!(set.contains(RollupField::Health));
        assert!(!set.contains(RollupField::Status));

        let both = set.union(ReevalFields::of(RollupField::Status));
        assert_eq!(
            both.iter().collect::<Vec<_>>(),
            vec![RollupField::Status, RollupField::Health]
        );
        assert_eq!(ReevalFields::from_bits(0xff), ReevalFields::ALL);
    }
}
