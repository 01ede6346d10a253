// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker re-evaluating no-data health of periodic datastreams.
//!
//! Each sweep locks the enabled datastreams with an update period whose
//! `health_next_eval_ts` has passed (oldest first, capped), recomputes their
//! no-data health, reschedules the next evaluation and marks the owning
//! device dirty when a datastream's health changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use monapps_core::model::{Field, Tracked};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::context::JobContext;
use crate::error::Result;
use crate::health;
use crate::scheduler;

/// Configuration for the datastream health worker.
#[derive(Debug, Clone)]
pub struct DsHealthUpdaterConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Maximum datastreams per sweep.
    pub batch_size: i64,
    /// Minimum time between two evaluations of one datastream.
    pub eval_interval_ms: i64,
    /// Multiplier on the datastream's update period for the next evaluation.
    pub eval_margin_coef: f64,
}

impl Default for DsHealthUpdaterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            eval_interval_ms: 5_000,
            eval_margin_coef: 1.5,
        }
    }
}

/// Background worker for datastream no-data health.
pub struct DsHealthUpdater {
    ctx: JobContext,
    config: DsHealthUpdaterConfig,
    shutdown: Arc<Notify>,
}

impl DsHealthUpdater {
    /// Create a new worker.
    pub fn new(ctx: JobContext, config: DsHealthUpdaterConfig) -> Self {
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
            "Datastream health updater started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Datastream health updater received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.update_periodic_ds_health().await {
                        error!(error = %e, "Failed to update datastream health");
                    }
                }
            }
        }

        info!("Datastream health updater stopped");
    }

    /// One sweep. Returns the number of datastreams evaluated.
    pub async fn update_periodic_ds_health(&self) -> Result<usize> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;

        let due = tx.lock_due_datastreams(now, self.config.batch_size).await?;
        if due.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut devices = BTreeSet::new();
        let mut saved = Vec::with_capacity(due.len());

        for ds in due {
            let mut ds = Tracked::new(ds);
            if health::refresh_datastream_health(&mut ds, now) {
                debug!(
                    datastream_id = ds.id,
                    health = %ds.health,
                    "Datastream health changed"
                );
                devices.insert(ds.device_id);
            }

            let next = health::next_eval_ts(
                &ds,
                now,
                self.config.eval_interval_ms,
                self.config.eval_margin_coef,
            );
            ds.set(Field::HealthNextEvalTs, |d| &mut d.health_next_eval_ts, next);

            tx.save_datastream(&ds).await?;
            saved.push(ds.into_parts());
        }

        for device_id in devices {
            scheduler::mark_device_dirty(&mut *tx, device_id, now, &self.ctx.debounce).await?;
        }

        tx.commit().await?;

        for (ds, fields) in &saved {
            self.ctx.notifier.notify_updated(ds, fields);
        }

        info!(count = saved.len(), "Evaluated datastream health");
        Ok(saved.len())
    }
}
