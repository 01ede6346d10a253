// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Creating, removing and enabling hierarchy members.
//!
//! Any structural change alters what a parent aggregates, so every helper
//! marks the parent dirty on all rollup fields in the same transaction and
//! publishes only after the commit.

use monapps_core::model::{
    Application, Asset, Datafeed, Datastream, Device, Field, HealthGrade, ReevalFields, Tracked,
};
use monapps_core::persistence::{
    NewAppType, NewApplication, NewAsset, NewDatafeed, NewDatastream, NewDevice,
};
use tracing::info;

use crate::alarm_log::{self, AlarmLevel};
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::publisher::MessageType;
use crate::scheduler;

/// Structural operations on the monitored hierarchy.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    ctx: JobContext,
}

impl Lifecycle {
    /// Create the helper.
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Create an asset under an optional parent.
    pub async fn create_asset(&self, new: NewAsset) -> Result<Asset> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let id = tx.insert_asset(&new).await?;
        let asset = tx
            .lock_asset(id)
            .await?
            .ok_or(Error::NotFound { entity: "asset", id })?;
        scheduler::mark_parent(&mut *tx, asset.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        tx.commit().await?;

        info!(asset_id = id, "Asset created");
        self.ctx.notifier.notify(&asset, MessageType::Create, None);
        Ok(asset)
    }

    /// Create a device. The identifier is stored lower-cased.
    pub async fn create_device(&self, mut new: NewDevice) -> Result<Device> {
        new.dev_ui = new.dev_ui.to_lowercase();
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let id = tx.insert_device(&new).await?;
        let device = tx
            .lock_device(id)
            .await?
            .ok_or(Error::NotFound { entity: "device", id })?;
        scheduler::mark_parent(&mut *tx, device.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        tx.commit().await?;

        info!(device_id = id, dev_ui = %device.dev_ui, "Device created");
        self.ctx.notifier.notify(&device, MessageType::Create, None);
        Ok(device)
    }

    /// Create a datastream and mark its device.
    pub async fn create_datastream(&self, new: NewDatastream) -> Result<Datastream> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let id = tx.insert_datastream(&new).await?;
        let datastream = tx
            .lock_datastream(id)
            .await?
            .ok_or(Error::NotFound { entity: "datastream", id })?;
        scheduler::mark_device_dirty(&mut *tx, datastream.device_id, now, &self.ctx.debounce)
            .await?;
        tx.commit().await?;

        info!(datastream_id = id, device_id = datastream.device_id, "Datastream created");
        self.ctx.notifier.notify(&datastream, MessageType::Create, None);
        Ok(datastream)
    }

    /// Register an application type.
    pub async fn create_app_type(&self, new: NewAppType) -> Result<i64> {
        let mut tx = self.ctx.store.begin().await?;
        let id = tx.insert_app_type(&new).await?;
        tx.commit().await?;
        info!(type_id = id, name = %new.name, func_name = %new.func_name, "App type created");
        Ok(id)
    }

    /// Create an application with its schedule.
    pub async fn create_application(&self, new: NewApplication) -> Result<Application> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let id = tx.insert_application(&new).await?;
        let app = tx
            .lock_application(id)
            .await?
            .ok_or(Error::NotFound { entity: "application", id })?;
        scheduler::mark_parent(&mut *tx, app.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        tx.commit().await?;

        info!(app_id = id, func_name = %app.func_name, "Application created");
        self.ctx.notifier.notify(&app, MessageType::Create, None);
        Ok(app)
    }

    /// Bind a datafeed to an application.
    pub async fn create_datafeed(&self, new: NewDatafeed) -> Result<Datafeed> {
        let mut tx = self.ctx.store.begin().await?;
        let id = tx.insert_datafeed(&new).await?;
        let feed = tx
            .lock_datafeeds(new.app_id)
            .await?
            .into_iter()
            .find(|f| f.id == id)
            .ok_or(Error::NotFound { entity: "datafeed", id })?;
        tx.commit().await?;

        self.ctx.notifier.notify(&feed, MessageType::Create, None);
        Ok(feed)
    }

    /// Delete an asset. Returns `false` when it does not exist.
    pub async fn delete_asset(&self, id: i64) -> Result<bool> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let Some(asset) = tx.lock_asset(id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        scheduler::mark_parent(&mut *tx, asset.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        let deleted = tx.delete_asset(id).await?;
        tx.commit().await?;

        if deleted {
            info!(asset_id = id, "Asset deleted");
            self.ctx.notifier.notify_deleted(&asset);
        }
        Ok(deleted)
    }

    /// Delete a device and its datastreams.
    pub async fn delete_device(&self, id: i64) -> Result<bool> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let datastreams = tx.lock_datastreams_of_device(id).await?;
        let Some(device) = tx.lock_device(id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        scheduler::mark_parent(&mut *tx, device.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        let deleted = tx.delete_device(id).await?;
        tx.commit().await?;

        if deleted {
            info!(device_id = id, datastreams = datastreams.len(), "Device deleted");
            for ds in &datastreams {
                self.ctx.notifier.notify_deleted(ds);
            }
            self.ctx.notifier.notify_deleted(&device);
        }
        Ok(deleted)
    }

    /// Delete a datastream and its readings.
    pub async fn delete_datastream(&self, id: i64) -> Result<bool> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let Some(datastream) = tx.lock_datastream(id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        scheduler::mark_device_dirty(&mut *tx, datastream.device_id, now, &self.ctx.debounce)
            .await?;
        let deleted = tx.delete_datastream(id).await?;
        tx.commit().await?;

        if deleted {
            info!(datastream_id = id, "Datastream deleted");
            self.ctx.notifier.notify_deleted(&datastream);
        }
        Ok(deleted)
    }

    /// Delete an application with its schedule, datafeeds and derived
    /// readings.
    pub async fn delete_application(&self, id: i64) -> Result<bool> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let Some(app) = tx.lock_application(id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        let feeds = tx.lock_datafeeds(id).await?;
        scheduler::mark_parent(&mut *tx, app.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        let deleted = tx.delete_application(id).await?;
        tx.commit().await?;

        if deleted {
            info!(app_id = id, "Application deleted");
            for feed in &feeds {
                self.ctx.notifier.notify_deleted(feed);
            }
            self.ctx.notifier.notify_deleted(&app);
        }
        Ok(deleted)
    }

    /// Enable or disable an application. Health restarts from `Undefined`
    /// either way. Returns whether the flag changed.
    pub async fn set_application_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;
        let Some(app) = tx.lock_application(id).await? else {
            tx.rollback().await?;
            return Err(Error::NotFound { entity: "application", id });
        };
        let mut app = Tracked::new(app);
        if !app.set(Field::IsEnabled, |a| &mut a.is_enabled, enabled) {
            tx.rollback().await?;
            return Ok(false);
        }
        app.set(Field::Health, |a| &mut a.health, HealthGrade::Undefined);

        tx.save_application(&app).await?;
        scheduler::mark_parent(&mut *tx, app.parent_id, ReevalFields::ALL, now, &self.ctx.debounce)
            .await?;
        tx.commit().await?;

        let (app, fields) = app.into_parts();
        let msg = if enabled { "Application enabled" } else { "Application disabled" };
        alarm_log::record(AlarmLevel::Info, &app, now, msg);
        self.ctx.notifier.notify_updated(&app, &fields);
        Ok(true)
    }
}
