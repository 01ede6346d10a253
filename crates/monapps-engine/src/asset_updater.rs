// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker rolling children up into assets.
//!
//! A sweep locks up to `batch_size` due assets. Some of them may be ancestors
//! of others, so the batch is arranged as the forest it induces (an asset is
//! a root when its parent is not in the batch) and walked children first:
//!
//! ```text
//!   due: [A, C, B]      A ── B ── C      order: C, B, A
//! ```
//!
//! Each asset is saved as soon as it is recomputed, so its parent reads the
//! fresh row. A change aimed at a parent inside the batch is merged into the
//! parent's pending fields in memory; a change aimed at a parent outside the
//! batch becomes a regular dirty mark for a later sweep.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use monapps_core::model::{Asset, Field, HealthGrade, ReevalFields, RollupField, Tracked};
use monapps_core::persistence::AssetChildren;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::context::JobContext;
use crate::error::Result;
use crate::scheduler;

/// Configuration for the asset worker.
#[derive(Debug, Clone)]
pub struct AssetUpdaterConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Maximum assets per sweep.
    pub batch_size: i64,
}

impl Default for AssetUpdaterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Background worker for asset rollups.
pub struct AssetUpdater {
    ctx: JobContext,
    config: AssetUpdaterConfig,
    shutdown: Arc<Notify>,
}

impl AssetUpdater {
    /// Create a new worker.
    pub fn new(ctx: JobContext, config: AssetUpdaterConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Asset updater started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Asset updater received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.update_assets().await {
                        error!(error = %e, "Failed to update assets");
                    }
                }
            }
        }

        info!("Asset updater stopped");
    }

    /// One sweep. Returns the number of assets processed.
    pub async fn update_assets(&self) -> Result<usize> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;

        let due = tx.lock_due_assets(now, self.config.batch_size).await?;
        if due.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let order = children_first(&due);
        let mut batch: BTreeMap<i64, Tracked<Asset>> = due
            .into_iter()
            .map(|asset| (asset.id, Tracked::new(asset)))
            .collect();

        let mut saved = Vec::with_capacity(order.len());
        for id in order {
            let Some(mut asset) = batch.remove(&id) else {
                continue;
            };

            let pending = asset.reeval_fields;
            if !pending.is_empty() {
                let children = tx.asset_children(id).await?;
                recompute(&mut asset, pending, &children, now);
            }

            let changed = scheduler::rollup_fields(asset.dirty());
            scheduler::reset_asset_schedule(&mut asset);
            tx.save_asset(&asset).await?;

            if !changed.is_empty()
                && let Some(parent_id) = asset.parent_id
            {
                match batch.get_mut(&parent_id) {
                    Some(parent) => {
                        let merged = parent.reeval_fields.union(changed);
                        parent.set(Field::ReevalFields, |p| &mut p.reeval_fields, merged);
                    }
                    None => {
                        scheduler::mark_asset_dirty(
                            &mut *tx,
                            parent_id,
                            changed,
                            now,
                            &self.ctx.debounce,
                        )
                        .await?;
                    }
                }
            }

            saved.push(asset.into_parts());
        }

        tx.commit().await?;

        for (asset, fields) in &saved {
            self.ctx.notifier.notify_updated(asset, fields);
        }

        info!(count = saved.len(), "Updated assets");
        Ok(saved.len())
    }
}

/// Order a batch so every asset comes after all of its descendants in the
/// batch. Roots keep their batch order. Cycles are broken arbitrarily.
pub(crate) fn children_first(due: &[Asset]) -> Vec<i64> {
    let ids: BTreeSet<i64> = due.iter().map(|a| a.id).collect();
    let mut children: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    let mut roots = Vec::new();
    for asset in due {
        match asset.parent_id {
            Some(parent) if ids.contains(&parent) && parent != asset.id => {
                children.entry(parent).or_default().push(asset.id);
            }
            _ => roots.push(asset.id),
        }
    }

    let mut order = Vec::with_capacity(due.len());
    let mut visited = BTreeSet::new();
    // Assets caught in a parent cycle have no root; start from them last.
    let starts = roots.into_iter().chain(due.iter().map(|a| a.id));
    for start in starts {
        if !visited.insert(start) {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            match children.get(&id).and_then(|kids| kids.get(next)).copied() {
                Some(kid) => {
                    top.1 += 1;
                    if visited.insert(kid) {
                        stack.push((kid, 0));
                    }
                }
                None => {
                    order.push(id);
                    stack.pop();
                }
            }
        }
    }
    order
}

/// Recompute the `pending` rollup fields of `asset` from its children.
///
/// A field without contributing children keeps its value. A changed
/// status/current state stamps its update time with `now`.
pub(crate) fn recompute(
    asset: &mut Tracked<Asset>,
    pending: ReevalFields,
    children: &AssetChildren,
    now: i64,
) {
    for field in pending.iter() {
        match field {
            RollupField::Health => {
                let grades = children
                    .applications
                    .iter()
                    .map(|a| a.health)
                    .chain(children.devices.iter().map(|d| d.health))
                    .chain(children.assets.iter().map(|a| a.health));
                if children.is_empty() {
                    continue;
                }
                let health = HealthGrade::worst(grades);
                if asset.set(Field::Health, |a| &mut a.health, health) {
                    debug!(asset_id = asset.id, health = %health, "Asset health changed");
                }
            }
            RollupField::Status => {
                let contributors = children
                    .applications
                    .iter()
                    .filter(|a| a.has_status())
                    .map(|a| (a.status, a.is_status_stale))
                    .chain(
                        children
                            .assets
                            .iter()
                            .filter(|a| a.status.is_some())
                            .map(|a| (a.status, a.is_status_stale)),
                    )
                    .collect::<Vec<_>>();
                let Some((value, stale)) = aggregate_signal(&contributors) else {
                    continue;
                };
                asset.set(Field::IsStatusStale, |a| &mut a.is_status_stale, stale);
                if let Some(value) = value
                    && asset.set(Field::Status, |a| &mut a.status, Some(value))
                {
                    asset.set(Field::LastStatusUpdateTs, |a| &mut a.last_status_update_ts, Some(now));
                }
            }
            RollupField::CurrState => {
                let contributors = children
                    .applications
                    .iter()
                    .filter(|a| a.has_curr_state())
                    .map(|a| (a.curr_state, a.is_curr_state_stale))
                    .chain(
                        children
                            .assets
                            .iter()
                            .filter(|a| a.curr_state.is_some())
                            .map(|a| (a.curr_state, a.is_curr_state_stale)),
                    )
                    .collect::<Vec<_>>();
                let Some((value, stale)) = aggregate_signal(&contributors) else {
                    continue;
                };
                asset.set(Field::IsCurrStateStale, |a| &mut a.is_curr_state_stale, stale);
                if let Some(value) = value
                    && asset.set(Field::CurrState, |a| &mut a.curr_state, Some(value))
                {
                    asset.set(
                        Field::LastCurrStateUpdateTs,
                        |a| &mut a.last_curr_state_update_ts,
                        Some(now),
                    );
                }
            }
        }
    }
}

/// Worst value over non-null contributors, and whether every contributor is
/// stale. `None` without contributors.
fn aggregate_signal(contributors: &[(Option<i32>, bool)]) -> Option<(Option<i32>, bool)> {
    if contributors.is_empty() {
        return None;
    }
    let value = contributors.iter().filter_map(|(v, _)| *v).max();
    let all_stale = contributors.iter().all(|(_, stale)| *stale);
    Some((value, all_stale))
}
