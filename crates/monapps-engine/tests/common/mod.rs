// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for monapps-engine integration tests.
//!
//! Provides TestContext: an in-memory SQLite store, a manual clock and a
//! broadcast publisher wired into a [`JobContext`], plus provisioning and
//! inspection helpers.

#![allow(dead_code)]

use std::sync::Arc;

use monapps_core::model::{
    AppSchedule, Application, Asset, Datastream, Device, Reading, ReadingKind, ReadingRange,
    ReevalFields,
};
use monapps_core::persistence::{
    NewAppType, NewApplication, NewAsset, NewDatafeed, NewDatastream, NewDevice, SqliteStore,
};
use monapps_core::{ManualClock, Store};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use monapps_engine::JobContext;
use monapps_engine::publisher::{BroadcastPublisher, ChangeMessage, ChangeNotifier};
use monapps_engine::scheduler::DebounceConfig;

/// Base delay used by every test: marks are due one second after they are placed.
pub const DEBOUNCE_MS: i64 = 1_000;

/// Test context that manages the store, clock and publisher for one test.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub clock: Arc<ManualClock>,
    pub publisher: Arc<BroadcastPublisher>,
    pub ctx: JobContext,
}

impl TestContext {
    /// Fresh database with the clock at `now`.
    pub async fn new(now: i64) -> Self {
        let store = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to open in-memory store"),
        );
        let clock = Arc::new(ManualClock::new(now));
        let publisher = Arc::new(BroadcastPublisher::new(256));
        let notifier = ChangeNotifier::new(publisher.clone(), "test");
        let debounce = DebounceConfig {
            base_delay_ms: 5_000,
            coef: 0.2,
        };
        let ctx = JobContext::new(store.clone(), notifier, clock.clone(), debounce);

        Self {
            store,
            clock,
            publisher,
            ctx,
        }
    }

    /// Subscribe to published changes. Publication only happens while a
    /// subscriber exists.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeMessage> {
        self.publisher.subscribe()
    }

    pub fn now(&self) -> i64 {
        self.ctx.now()
    }

    pub fn set_now(&self, now: i64) {
        self.clock.set(now);
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    pub async fn asset(&self, name: &str, parent_id: Option<i64>) -> i64 {
        let mut tx = self.store.begin().await.unwrap();
        let id = tx
            .insert_asset(&NewAsset {
                name: name.to_string(),
                parent_id,
                created_ts: 0,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    pub async fn device(&self, dev_ui: &str, parent_id: Option<i64>) -> i64 {
        let mut tx = self.store.begin().await.unwrap();
        let id = tx
            .insert_device(&NewDevice {
                dev_ui: dev_ui.to_string(),
                name: dev_ui.to_string(),
                parent_id,
                created_ts: 0,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    /// Enabled channel created at 0 with a 10 s no-data threshold.
    pub async fn datastream(&self, device_id: i64, name: &str, time_update: Option<i64>) -> i64 {
        let mut tx = self.store.begin().await.unwrap();
        let id = tx
            .insert_datastream(&NewDatastream {
                device_id,
                name: name.to_string(),
                is_enabled: true,
                is_value_integer: false,
                time_update,
                time_nd_health_error: 10_000,
                created_ts: 0,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    pub async fn app_type(&self, name: &str, func_name: &str, df_schema: Value) -> i64 {
        let mut tx = self.store.begin().await.unwrap();
        let id = tx
            .insert_app_type(&NewAppType {
                name: name.to_string(),
                func_name: func_name.to_string(),
                df_schema,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    /// Application of `type_id` pinned to version 0.0.1, adjusted by `tweak`.
    pub async fn application(
        &self,
        type_id: i64,
        parent_id: Option<i64>,
        tweak: impl FnOnce(&mut NewApplication),
    ) -> i64 {
        let mut new = NewApplication::new(type_id, "0.0.1", 0);
        new.parent_id = parent_id;
        tweak(&mut new);

        let mut tx = self.store.begin().await.unwrap();
        let id = tx.insert_application(&new).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    pub async fn datafeed(
        &self,
        app_id: i64,
        name: &str,
        datastream_id: Option<i64>,
        is_value_integer: bool,
    ) -> i64 {
        let mut tx = self.store.begin().await.unwrap();
        let id = tx
            .insert_datafeed(&NewDatafeed {
                app_id,
                name: name.to_string(),
                datastream_id,
                is_value_integer,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    pub async fn ds_readings_insert(&self, datastream_id: i64, readings: &[Reading]) {
        let mut tx = self.store.begin().await.unwrap();
        tx.insert_ds_readings(datastream_id, ReadingKind::Valid, readings, false)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    pub async fn df_readings_insert(&self, feed_id: i64, readings: &[Reading]) {
        let mut tx = self.store.begin().await.unwrap();
        tx.insert_df_readings(feed_id, readings).await.unwrap();
        tx.commit().await.unwrap();
    }

    // ------------------------------------------------------------------
    // Direct edits
    // ------------------------------------------------------------------

    pub async fn update_device(&self, id: i64, edit: impl FnOnce(&mut Device)) {
        let mut tx = self.store.begin().await.unwrap();
        let mut device = tx.lock_device(id).await.unwrap().expect("device");
        edit(&mut device);
        tx.save_device(&device).await.unwrap();
        tx.commit().await.unwrap();
    }

    pub async fn update_application(&self, id: i64, edit: impl FnOnce(&mut Application)) {
        let mut tx = self.store.begin().await.unwrap();
        let mut app = tx.lock_application(id).await.unwrap().expect("application");
        edit(&mut app);
        tx.save_application(&app).await.unwrap();
        tx.commit().await.unwrap();
    }

    pub async fn mark_device(&self, id: i64, due: i64) {
        let mut tx = self.store.begin().await.unwrap();
        assert!(tx.mark_device_dirty(id, due).await.unwrap());
        tx.commit().await.unwrap();
    }

    pub async fn mark_asset(&self, id: i64, fields: ReevalFields, due: i64) {
        let mut tx = self.store.begin().await.unwrap();
        assert!(tx.mark_asset_dirty(id, fields, due).await.unwrap());
        tx.commit().await.unwrap();
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn load_asset(&self, id: i64) -> Asset {
        let mut tx = self.store.begin().await.unwrap();
        let asset = tx.lock_asset(id).await.unwrap().expect("asset");
        tx.commit().await.unwrap();
        asset
    }

    pub async fn load_device(&self, id: i64) -> Device {
        let mut tx = self.store.begin().await.unwrap();
        let device = tx.lock_device(id).await.unwrap().expect("device");
        tx.commit().await.unwrap();
        device
    }

    pub async fn load_datastream(&self, id: i64) -> Datastream {
        let mut tx = self.store.begin().await.unwrap();
        let ds = tx.lock_datastream(id).await.unwrap().expect("datastream");
        tx.commit().await.unwrap();
        ds
    }

    pub async fn load_application(&self, id: i64) -> Application {
        let mut tx = self.store.begin().await.unwrap();
        let app = tx.lock_application(id).await.unwrap().expect("application");
        tx.commit().await.unwrap();
        app
    }

    pub async fn load_schedule(&self, app_id: i64) -> AppSchedule {
        let mut tx = self.store.begin().await.unwrap();
        let schedule = tx.lock_app_schedule(app_id).await.unwrap().expect("schedule");
        tx.commit().await.unwrap();
        schedule
    }

    pub async fn ds_readings(&self, datastream_id: i64, kind: ReadingKind) -> Vec<Reading> {
        let mut tx = self.store.begin().await.unwrap();
        let readings = tx
            .list_ds_readings(datastream_id, kind, &ReadingRange::default())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        readings
    }

    pub async fn df_readings(&self, feed_id: i64) -> Vec<Reading> {
        let mut tx = self.store.begin().await.unwrap();
        let readings = tx
            .list_df_readings(feed_id, &ReadingRange::default())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        readings
    }
}

/// Schema declaring both rollup feeds.
pub fn status_schema() -> Value {
    json!({
        "Status": {"datatype": "int", "derived": true},
        "Current state": {"datatype": "int", "derived": true}
    })
}

/// Every message currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<ChangeMessage>) -> Vec<ChangeMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
