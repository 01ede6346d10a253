// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dirty-field scheduling.
//!
//! A child change never recomputes its parent directly. It marks the parent
//! with the rollup fields to re-evaluate and pulls the parent's due time down
//! to `now + base_delay * coef`. The marks are merged in the database
//! (`reeval_fields | new`, `LEAST(next_upd_ts, due)`), so any number of
//! child changes inside one debounce window collapse into one sweep of the
//! parent. A sweep consumes the marks with [`reset_asset_schedule`] /
//! [`reset_device_schedule`].

use std::collections::BTreeSet;

use monapps_core::StoreTx;
use monapps_core::model::{Asset, Device, Field, MAX_TS_MS, ReevalFields, RollupField, Tracked};
use tracing::{debug, warn};

use crate::error::Result;

/// Debounce applied to dirty marks.
#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    /// Base asset update delay in milliseconds.
    pub base_delay_ms: i64,
    /// Fraction of the base delay a mark waits before it is due.
    pub coef: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            coef: 0.2,
        }
    }
}

impl DebounceConfig {
    /// Due time for a mark placed at `now`.
    pub fn due_time(&self, now: i64) -> i64 {
        now + (self.base_delay_ms as f64 * self.coef).round() as i64
    }
}

/// Mark an asset for recomputation of `fields`.
///
/// Returns `false` when the asset no longer exists.
pub async fn mark_asset_dirty(
    tx: &mut dyn StoreTx,
    asset_id: i64,
    fields: ReevalFields,
    now: i64,
    debounce: &DebounceConfig,
) -> Result<bool> {
    let due = debounce.due_time(now);
    let found = tx.mark_asset_dirty(asset_id, fields, due).await?;
    if found {
        debug!(asset_id, fields = fields.bits(), due, "Asset marked dirty");
    } else {
        warn!(asset_id, "Dirty mark for missing asset ignored");
    }
    Ok(found)
}

/// Mark a device for recomputation of its health.
pub async fn mark_device_dirty(
    tx: &mut dyn StoreTx,
    device_id: i64,
    now: i64,
    debounce: &DebounceConfig,
) -> Result<bool> {
    let due = debounce.due_time(now);
    let found = tx.mark_device_dirty(device_id, due).await?;
    if found {
        debug!(device_id, due, "Device marked dirty");
    } else {
        warn!(device_id, "Dirty mark for missing device ignored");
    }
    Ok(found)
}

/// Mark an optional parent asset, skipping orphans and empty field sets.
pub async fn mark_parent(
    tx: &mut dyn StoreTx,
    parent_id: Option<i64>,
    fields: ReevalFields,
    now: i64,
    debounce: &DebounceConfig,
) -> Result<()> {
    if let Some(parent_id) = parent_id
        && !fields.is_empty()
    {
        mark_asset_dirty(tx, parent_id, fields, now, debounce).await?;
    }
    Ok(())
}

/// Rollup fields a parent must re-evaluate after `changed` moved on a child.
///
/// Staleness flags feed the same rollup as their signal.
pub fn rollup_fields(changed: &BTreeSet<Field>) -> ReevalFields {
    changed
        .iter()
        .filter_map(|field| match field {
            Field::Status | Field::IsStatusStale => Some(RollupField::Status),
            Field::CurrState | Field::IsCurrStateStale => Some(RollupField::CurrState),
            Field::Health => Some(RollupField::Health),
            _ => None,
        })
        .collect()
}

/// Consume an asset's pending marks.
pub fn reset_asset_schedule(asset: &mut Tracked<Asset>) {
    asset.set(Field::ReevalFields, |a| &mut a.reeval_fields, ReevalFields::NONE);
    asset.set(Field::NextUpdTs, |a| &mut a.next_upd_ts, MAX_TS_MS);
}

/// Consume a device's pending mark.
pub fn reset_device_schedule(device: &mut Tracked<Device>) {
    device.set(Field::NextUpdTs, |d| &mut d.next_upd_ts, MAX_TS_MS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_time_applies_coefficient() {
        let debounce = DebounceConfig::default();
        assert_eq!(debounce.due_time(10_000), 11_000);

        let immediate = DebounceConfig {
            base_delay_ms: 5_000,
            coef: 0.0,
        };
        assert_eq!(immediate.due_time(10_000), 10_000);
    }

    #[test]
    fn test_staleness_flags_roll_up_as_their_signal() {
        let changed = BTreeSet::from([Field::IsStatusStale, Field::Health, Field::CursorTs]);
        let fields = rollup_fields(&changed);
        assert!(fields.contains(RollupField::Status));
        assert!(fields.contains(RollupField::Health));
        assert!(!fields.contains(RollupField::CurrState));

        let changed = BTreeSet::from([Field::IsCurrStateStale]);
        assert_eq!(
            rollup_fields(&changed),
            ReevalFields::of(RollupField::CurrState)
        );
    }

    #[test]
    fn test_bookkeeping_changes_do_not_roll_up() {
        let changed = BTreeSet::from([
            Field::LastStatusUpdateTs,
            Field::CursorTs,
            Field::State,
            Field::Errors,
        ]);
        assert!(rollup_fields(&changed).is_empty());
    }
}
