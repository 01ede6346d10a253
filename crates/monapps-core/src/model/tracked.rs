// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Field-level change tracking.
//!
//! Jobs never assign entity columns directly. They go through
//! [`Tracked::set`] and friends, which only write when the value actually
//! changes and remember which [`Field`]s did. The dirty set then drives
//! parent marks and change publication.

use std::collections::BTreeSet;
use std::ops::Deref;

/// Mutable entity column that can be reported as changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Field {
    Status,
    CurrState,
    Health,
    IsStatusStale,
    IsCurrStateStale,
    LastStatusUpdateTs,
    LastCurrStateUpdateTs,
    ReevalFields,
    NextUpdTs,
    MsgHealth,
    ChldHealth,
    NdHealth,
    LastReadingTs,
    HealthNextEvalTs,
    Errors,
    Warnings,
    State,
    CursorTs,
    IsEnabled,
    IsCatchingUp,
}

impl Field {
    /// Name used in change notifications.
    pub const fn camel_name(self) -> &'static str {
        match self {
            Field::Status => "status",
            Field::CurrState => "currState",
            Field::Health => "health",
            Field::IsStatusStale => "isStatusStale",
            Field::IsCurrStateStale => "isCurrStateStale",
            Field::LastStatusUpdateTs => "lastStatusUpdateTs",
            Field::LastCurrStateUpdateTs => "lastCurrStateUpdateTs",
            Field::ReevalFields => "reevalFields",
            Field::NextUpdTs => "nextUpdTs",
            Field::MsgHealth => "msgHealth",
            Field::ChldHealth => "chldHealth",
            Field::NdHealth => "ndHealth",
            Field::LastReadingTs => "lastReadingTs",
            Field::HealthNextEvalTs => "healthNextEvalTs",
            Field::Errors => "errors",
            Field::Warnings => "warnings",
            Field::State => "state",
            Field::CursorTs => "cursorTs",
            Field::IsEnabled => "isEnabled",
            Field::IsCatchingUp => "isCatchingUp",
        }
    }
}

/// An entity plus the set of fields changed since it was loaded.
#[derive(Debug, Clone)]
pub struct Tracked<T> {
    inner: T,
    dirty: BTreeSet<Field>,
}

impl<T> Tracked<T> {
    /// Start tracking a freshly loaded entity.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            dirty: BTreeSet::new(),
        }
    }

    /// Assign `value` when it differs from the current one. Returns whether
    /// anything changed.
    pub fn set<V: PartialEq>(
        &mut self,
        field: Field,
        slot: impl FnOnce(&mut T) -> &mut V,
        value: V,
    ) -> bool {
        self.set_when(field, slot, value, |current, new| current != new)
    }

    /// Assign `value` only when it is strictly greater than the current one.
    pub fn set_if_greater<V: PartialOrd>(
        &mut self,
        field: Field,
        slot: impl FnOnce(&mut T) -> &mut V,
        value: V,
    ) -> bool {
        self.set_when(field, slot, value, |current, new| new > current)
    }

    /// Assign a timestamp when the column is empty or older than `ts`.
    pub fn set_if_newer(
        &mut self,
        field: Field,
        slot: impl FnOnce(&mut T) -> &mut Option<i64>,
        ts: i64,
    ) -> bool {
        self.set_when(field, slot, Some(ts), |current, new| {
            current.is_none_or(|c| new.is_some_and(|n| n > c))
        })
    }

    /// Assign `value` when `cond(current, &value)` holds.
    pub fn set_when<V>(
        &mut self,
        field: Field,
        slot: impl FnOnce(&mut T) -> &mut V,
        value: V,
        cond: impl FnOnce(&V, &V) -> bool,
    ) -> bool {
        let current = slot(&mut self.inner);
        if !cond(current, &value) {
            return false;
        }
        *current = value;
        self.dirty.insert(field);
        true
    }

    /// Fields changed so far.
    pub fn dirty(&self) -> &BTreeSet<Field> {
        &self.dirty
    }

    /// Whether `field` has changed.
    pub fn is_dirty(&self, field: Field) -> bool {
        self.dirty.contains(&field)
    }

    /// Whether any field has changed.
    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Replace the entity wholesale and forget tracked changes.
    pub fn reset(&mut self, inner: T) {
        self.inner = inner;
        self.dirty.clear();
    }

    /// Split into the entity and its dirty set.
    pub fn into_parts(self) -> (T, BTreeSet<Field>) {
        (self.inner, self.dirty)
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}
