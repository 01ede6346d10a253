// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker rolling datastream health up into devices.

use std::sync::Arc;
use std::time::Duration;

use monapps_core::model::{Field, HealthGrade, ReevalFields, RollupField, Tracked};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::context::JobContext;
use crate::error::Result;
use crate::scheduler;

/// Configuration for the device worker.
#[derive(Debug, Clone)]
pub struct DeviceUpdaterConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Maximum devices per sweep.
    pub batch_size: i64,
}

impl Default for DeviceUpdaterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
        }
    }
}

/// Background worker for device health.
pub struct DeviceUpdater {
    ctx: JobContext,
    config: DeviceUpdaterConfig,
    shutdown: Arc<Notify>,
}

impl DeviceUpdater {
    /// Create a new worker.
    pub fn new(ctx: JobContext, config: DeviceUpdaterConfig) -> Self {
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
            "Device updater started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Device updater received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.update_devices().await {
                        error!(error = %e, "Failed to update devices");
                    }
                }
            }
        }

        info!("Device updater stopped");
    }

    /// One sweep. Returns the number of devices recomputed.
    ///
    /// `chld_health` is the worst health of the device's enabled datastreams
    /// and `health` the worst of `msg_health` and `chld_health`. A health
    /// change marks the owning asset.
    pub async fn update_devices(&self) -> Result<usize> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;

        let due = tx.lock_due_devices(now, self.config.batch_size).await?;
        if due.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut saved = Vec::with_capacity(due.len());
        for device in due {
            let mut device = Tracked::new(device);
            let children = tx.enabled_datastreams(device.id).await?;

            let chld_health = HealthGrade::worst(children.iter().map(|ds| ds.health));
            device.set(Field::ChldHealth, |d| &mut d.chld_health, chld_health);

            let health = HealthGrade::worst([device.msg_health, device.chld_health]);
            if device.set(Field::Health, |d| &mut d.health, health) {
                debug!(device_id = device.id, health = %health, "Device health changed");
                scheduler::mark_parent(
                    &mut *tx,
                    device.parent_id,
                    ReevalFields::of(RollupField::Health),
                    now,
                    &self.ctx.debounce,
                )
                .await?;
            }

            scheduler::reset_device_schedule(&mut device);
            tx.save_device(&device).await?;
            saved.push(device.into_parts());
        }

        tx.commit().await?;

        for (device, fields) in &saved {
            self.ctx.notifier.notify_updated(device, fields);
        }

        info!(count = saved.len(), "Updated devices");
        Ok(saved.len())
    }
}
