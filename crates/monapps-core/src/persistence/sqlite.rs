// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! The pool holds exactly one connection, so at most one transaction is open
//! at a time and a transaction sees no concurrent writers. That replaces the
//! row locks of the Postgres backend. A job must therefore do all of its work
//! through its [`StoreTx`]; asking the [`Store`] for a second transaction
//! while one is open waits forever.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::model::{
    AppSchedule, AppType, Application, Asset, Datafeed, Datastream, Device, Reading, ReadingKind,
    ReadingRange, ReevalFields,
};

use super::{
    APPLICATION_SELECT, ASSET_COLUMNS, AssetChildren, DATAFEED_COLUMNS, DATASTREAM_COLUMNS,
    DEVICE_COLUMNS, INSERT_CHUNK, NewAppType, NewApplication, NewAsset, NewDatafeed,
    NewDatastream, NewDevice, SCHEDULE_COLUMNS, Store, StoreTx, check_savepoint_name, push_range,
};

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url`, run migrations and keep a single connection open.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // One connection that never expires, otherwise an in-memory database
        // would vanish with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        crate::migrations::run_sqlite(&pool).await?;
        info!(url = %url, "Opened SQLite store");

        Ok(Self { pool })
    }

    /// Fresh in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Open (or create) a database file, creating parent directories as needed.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/monapps.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteStoreTx { tx }))
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

/// Open SQLite transaction.
pub struct SqliteStoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteStoreTx {
    async fn exec(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for SqliteStoreTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        self.exec(&format!("SAVEPOINT {name}")).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        self.exec(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
        debug!(savepoint = name, "Rolled back to savepoint");
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        check_savepoint_name(name)?;
        self.exec(&format!("RELEASE SAVEPOINT {name}")).await
    }

    // ========================================================================
    // Due selection
    // ========================================================================

    async fn lock_due_datastreams(&mut self, now: i64, limit: i64) -> Result<Vec<Datastream>> {
        let rows = sqlx::query_as::<_, Datastream>(&format!(
            r#"
            SELECT {DATASTREAM_COLUMNS}
            FROM datastreams
            WHERE id IN (
                SELECT id FROM datastreams
                WHERE is_enabled AND time_update IS NOT NULL AND health_next_eval_ts <= ?1
                ORDER BY health_next_eval_ts, id
                LIMIT ?2
            )
            AND health_next_eval_ts <= ?1
            ORDER BY id
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn lock_due_devices(&mut self, now: i64, limit: i64) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, Device>(&format!(
            r#"
            SELECT {DEVICE_COLUMNS}
            FROM devices
            WHERE id IN (
                SELECT id FROM devices
                WHERE next_upd_ts <= ?1
                ORDER BY next_upd_ts, id
                LIMIT ?2
            )
            AND next_upd_ts <= ?1
            ORDER BY id
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn lock_due_assets(&mut self, now: i64, limit: i64) -> Result<Vec<Asset>> {
        let rows = sqlx::query_as::<_, Asset>(&format!(
            r#"
            SELECT {ASSET_COLUMNS}
            FROM assets
            WHERE id IN (
                SELECT id FROM assets
                WHERE next_upd_ts <= ?1
                ORDER BY next_upd_ts, id
                LIMIT ?2
            )
            AND next_upd_ts <= ?1
            ORDER BY id
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn due_app_schedules(&mut self, now: i64, limit: i64) -> Result<Vec<AppSchedule>> {
        let rows = sqlx::query_as::<_, AppSchedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM app_schedules
            WHERE is_enabled AND next_run_ts <= ?1
            ORDER BY next_run_ts
            LIMIT ?2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    // ========================================================================
    // Single rows
    // ========================================================================

    async fn lock_asset(&mut self, id: i64) -> Result<Option<Asset>> {
        let row = sqlx::query_as::<_, Asset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_device(&mut self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_device_id(&mut self, dev_ui: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM devices WHERE dev_ui = ?1")
            .bind(dev_ui)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn lock_datastream(&mut self, id: i64) -> Result<Option<Datastream>> {
        let row = sqlx::query_as::<_, Datastream>(&format!(
            "SELECT {DATASTREAM_COLUMNS} FROM datastreams WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_datastreams_of_device(&mut self, device_id: i64) -> Result<Vec<Datastream>> {
        let rows = sqlx::query_as::<_, Datastream>(&format!(
            "SELECT {DATASTREAM_COLUMNS} FROM datastreams WHERE device_id = ?1 ORDER BY id"
        ))
        .bind(device_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn lock_application(&mut self, id: i64) -> Result<Option<Application>> {
        let row = sqlx::query_as::<_, Application>(&format!(
            "{APPLICATION_SELECT} WHERE a.id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_app_schedule(&mut self, app_id: i64) -> Result<Option<AppSchedule>> {
        let row = sqlx::query_as::<_, AppSchedule>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM app_schedules WHERE app_id = ?1"
        ))
        .bind(app_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_datafeeds(&mut self, app_id: i64) -> Result<Vec<Datafeed>> {
        let rows = sqlx::query_as::<_, Datafeed>(&format!(
            "SELECT {DATAFEED_COLUMNS} FROM datafeeds WHERE app_id = ?1 ORDER BY id"
        ))
        .bind(app_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    // ========================================================================
    // Child lookups
    // ========================================================================

    async fn enabled_datastreams(&mut self, device_id: i64) -> Result<Vec<Datastream>> {
        let rows = sqlx::query_as::<_, Datastream>(&format!(
            "SELECT {DATASTREAM_COLUMNS} FROM datastreams WHERE device_id = ?1 AND is_enabled ORDER BY id"
        ))
        .bind(device_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn asset_children(&mut self, asset_id: i64) -> Result<AssetChildren> {
        let applications = sqlx::query_as::<_, Application>(&format!(
            "{APPLICATION_SELECT} WHERE a.parent_id = ?1 ORDER BY a.id"
        ))
        .bind(asset_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let devices = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE parent_id = ?1 ORDER BY id"
        ))
        .bind(asset_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let assets = sqlx::query_as::<_, Asset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE parent_id = ?1 ORDER BY id"
        ))
        .bind(asset_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(AssetChildren {
            applications,
            devices,
            assets,
        })
    }

    async fn app_type(&mut self, id: i64) -> Result<Option<AppType>> {
        let row = sqlx::query_as::<_, AppType>(
            "SELECT id, name, func_name, df_schema FROM app_types WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    // ========================================================================
    // Dirty marks
    // ========================================================================

    async fn mark_asset_dirty(
        &mut self,
        asset_id: i64,
        fields: ReevalFields,
        due_ts: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE assets
            SET reeval_fields = reeval_fields | ?2,
                next_upd_ts = MIN(next_upd_ts, ?3)
            WHERE id = ?1
            "#,
        )
        .bind(asset_id)
        .bind(fields)
        .bind(due_ts)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_device_dirty(&mut self, device_id: i64, due_ts: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET next_upd_ts = MIN(next_upd_ts, ?2) WHERE id = ?1",
        )
        .bind(device_id)
        .bind(due_ts)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Saves
    // ========================================================================

    async fn save_asset(&mut self, asset: &Asset) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE assets
            SET status = ?2,
                curr_state = ?3,
                health = ?4,
                is_status_stale = ?5,
                is_curr_state_stale = ?6,
                last_status_update_ts = ?7,
                last_curr_state_update_ts = ?8,
                reeval_fields = ?9,
                next_upd_ts = ?10
            WHERE id = ?1
            "#,
        )
        .bind(asset.id)
        .bind(asset.status)
        .bind(asset.curr_state)
        .bind(asset.health)
        .bind(asset.is_status_stale)
        .bind(asset.is_curr_state_stale)
        .bind(asset.last_status_update_ts)
        .bind(asset.last_curr_state_update_ts)
        .bind(asset.reeval_fields)
        .bind(asset.next_upd_ts)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn save_device(&mut self, device: &Device) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE devices
            SET msg_health = ?2,
                chld_health = ?3,
                health = ?4,
                errors = ?5,
                warnings = ?6,
                next_upd_ts = ?7
            WHERE id = ?1
            "#,
        )
        .bind(device.id)
        .bind(device.msg_health)
        .bind(device.chld_health)
        .bind(device.health)
        .bind(Json(&device.errors))
        .bind(Json(&device.warnings))
        .bind(device.next_upd_ts)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn save_datastream(&mut self, ds: &Datastream) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE datastreams
            SET is_enabled = ?2,
                msg_health = ?3,
                nd_health = ?4,
                health = ?5,
                last_reading_ts = ?6,
                health_next_eval_ts = ?7
            WHERE id = ?1
            "#,
        )
        .bind(ds.id)
        .bind(ds.is_enabled)
        .bind(ds.msg_health)
        .bind(ds.nd_health)
        .bind(ds.health)
        .bind(ds.last_reading_ts)
        .bind(ds.health_next_eval_ts)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn save_application(&mut self, app: &Application) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE applications
            SET state = ?2,
                errors = ?3,
                warnings = ?4,
                cursor_ts = ?5,
                is_enabled = ?6,
                is_catching_up = ?7,
                status = ?8,
                curr_state = ?9,
                last_status_update_ts = ?10,
                last_curr_state_update_ts = ?11,
                is_status_stale = ?12,
                is_curr_state_stale = ?13,
                health = ?14
            WHERE id = ?1
            "#,
        )
        .bind(app.id)
        .bind(Json(&app.state))
        .bind(Json(&app.errors))
        .bind(Json(&app.warnings))
        .bind(app.cursor_ts)
        .bind(app.is_enabled)
        .bind(app.is_catching_up)
        .bind(app.status)
        .bind(app.curr_state)
        .bind(app.last_status_update_ts)
        .bind(app.last_curr_state_update_ts)
        .bind(app.is_status_stale)
        .bind(app.is_curr_state_stale)
        .bind(app.health)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn save_app_schedule(&mut self, schedule: &AppSchedule) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE app_schedules
            SET interval_ms = ?2, next_run_ts = ?3, is_enabled = ?4
            WHERE app_id = ?1
            "#,
        )
        .bind(schedule.app_id)
        .bind(schedule.interval_ms)
        .bind(schedule.next_run_ts)
        .bind(schedule.is_enabled)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn save_datafeed(&mut self, feed: &Datafeed) -> Result<()> {
        sqlx::query("UPDATE datafeeds SET last_reading_ts = ?2 WHERE id = ?1")
            .bind(feed.id)
            .bind(feed.last_reading_ts)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Readings
    // ========================================================================

    async fn insert_df_readings(&mut self, feed_id: i64, readings: &[Reading]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in readings.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO df_readings (datafeed_id, time, value, restored) ",
            );
            qb.push_values(chunk, |mut row, reading| {
                row.push_bind(feed_id)
                    .push_bind(reading.time)
                    .push_bind(reading.value)
                    .push_bind(reading.restored);
            });
            let result = qb
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StoreError::from_insert(e, feed_id))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_ds_readings(
        &mut self,
        datastream_id: i64,
        kind: ReadingKind,
        readings: &[Reading],
        skip_duplicates: bool,
    ) -> Result<u64> {
        let mut inserted = 0;
        for chunk in readings.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} (datastream_id, time, value, restored) ",
                kind.table()
            ));
            qb.push_values(chunk, |mut row, reading| {
                row.push_bind(datastream_id)
                    .push_bind(reading.time)
                    .push_bind(reading.value)
                    .push_bind(reading.restored);
            });
            if skip_duplicates {
                qb.push(" ON CONFLICT (datastream_id, time) DO NOTHING");
            }
            let result = qb
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(|e| StoreError::from_insert(e, datastream_id))?;
            inserted += result.rows_affected();
        }
        let skipped = (readings.len() as u64).saturating_sub(inserted);
        if skipped > 0 {
            debug!(datastream_id, skipped, table = kind.table(), "Skipped duplicate readings");
        }
        Ok(inserted)
    }

    async fn list_df_readings(
        &mut self,
        feed_id: i64,
        range: &ReadingRange,
    ) -> Result<Vec<Reading>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT time, value, restored FROM df_readings WHERE datafeed_id = ",
        );
        qb.push_bind(feed_id);
        push_range(&mut qb, range);
        let rows = qb
            .build_query_as::<Reading>()
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn list_ds_readings(
        &mut self,
        datastream_id: i64,
        kind: ReadingKind,
        range: &ReadingRange,
    ) -> Result<Vec<Reading>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT time, value, restored FROM {} WHERE datastream_id = ",
            kind.table()
        ));
        qb.push_bind(datastream_id);
        push_range(&mut qb, range);
        let rows = qb
            .build_query_as::<Reading>()
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    // ========================================================================
    // Provisioning and removal
    // ========================================================================

    async fn insert_asset(&mut self, new: &NewAsset) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO assets (name, parent_id, created_ts) VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(&new.name)
        .bind(new.parent_id)
        .bind(new.created_ts)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_device(&mut self, new: &NewDevice) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO devices (dev_ui, name, parent_id, created_ts)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING id
            "#,
        )
        .bind(new.dev_ui.to_lowercase())
        .bind(&new.name)
        .bind(new.parent_id)
        .bind(new.created_ts)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_datastream(&mut self, new: &NewDatastream) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO datastreams (
                device_id, name, is_enabled, is_value_integer, time_update,
                time_nd_health_error, health_next_eval_ts, created_ts
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            RETURNING id
            "#,
        )
        .bind(new.device_id)
        .bind(&new.name)
        .bind(new.is_enabled)
        .bind(new.is_value_integer)
        .bind(new.time_update)
        .bind(new.time_nd_health_error)
        .bind(new.created_ts)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_app_type(&mut self, new: &NewAppType) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO app_types (name, func_name, df_schema) VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(&new.name)
        .bind(&new.func_name)
        .bind(Json(&new.df_schema))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_application(&mut self, new: &NewApplication) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO applications (
                type_id, func_version, time_resample, settings, cursor_ts, is_enabled,
                invoc_interval_ms, catch_up_interval_ms, time_status_stale,
                time_curr_state_stale, time_health_error, parent_id, created_ts
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            RETURNING id
            "#,
        )
        .bind(new.type_id)
        .bind(&new.func_version)
        .bind(new.time_resample)
        .bind(Json(&new.settings))
        .bind(new.cursor_ts)
        .bind(new.is_enabled)
        .bind(new.invoc_interval_ms)
        .bind(new.catch_up_interval_ms)
        .bind(new.time_status_stale)
        .bind(new.time_curr_state_stale)
        .bind(new.time_health_error)
        .bind(new.parent_id)
        .bind(new.created_ts)
        .fetch_one(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO app_schedules (app_id, interval_ms, next_run_ts, is_enabled)
            VALUES (?1, ?2, ?3, 1)
            "#,
        )
        .bind(id)
        .bind(new.invoc_interval_ms)
        .bind(new.created_ts)
        .execute(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_datafeed(&mut self, new: &NewDatafeed) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO datafeeds (app_id, name, datastream_id, is_value_integer)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING id
            "#,
        )
        .bind(new.app_id)
        .bind(&new.name)
        .bind(new.datastream_id)
        .bind(new.is_value_integer)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn delete_asset(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assets WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_device(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_datastream(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM datastreams WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_application(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM applications WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthGrade, MAX_TS_MS, RollupField};
    use serde_json::json;

    async fn test_store() -> SqliteStore {
        SqliteStore::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store")
    }

    async fn insert_app(tx: &mut Box<dyn StoreTx>, parent_id: Option<i64>) -> i64 {
        let type_id = tx
            .insert_app_type(&NewAppType {
                name: format!("type-{}", parent_id.unwrap_or(0)),
                func_name: "monitoring".into(),
                df_schema: json!({"Status": {"datatype": "int", "derived": true}}),
            })
            .await
            .unwrap();
        let mut new = NewApplication::new(type_id, "0.0.1", 100);
        new.parent_id = parent_id;
        tx.insert_application(&new).await.unwrap()
    }

    #[tokio::test]
    async fn test_due_assets_pick_oldest_and_lock_by_id() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();

        let mut ids = Vec::new();
        for (i, due) in [300, 200, 100, MAX_TS_MS].into_iter().enumerate() {
            let id = tx
                .insert_asset(&NewAsset {
                    name: format!("asset-{i}"),
                    parent_id: None,
                    created_ts: 0,
                })
                .await
                .unwrap();
            tx.mark_asset_dirty(id, ReevalFields::ALL, due).await.unwrap();
            ids.push(id);
        }

        let due = tx.lock_due_assets(250, 10).await.unwrap();
        assert_eq!(
            due.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![ids[1], ids[2]]
        );

        // The oldest two are picked, then handed back in id order.
        let capped = tx.lock_due_assets(1_000, 2).await.unwrap();
        assert_eq!(
            capped.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![ids[1], ids[2]]
        );

        let all = tx.lock_due_assets(1_000, 10).await.unwrap();
        assert_eq!(
            all.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![ids[0], ids[1], ids[2]]
        );

        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_asset_dirty_merges_fields_and_keeps_earliest_due() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let id = tx
            .insert_asset(&NewAsset {
                name: "site".into(),
                parent_id: None,
                created_ts: 0,
            })
            .await
            .unwrap();

        let fresh = tx.lock_asset(id).await.unwrap().unwrap();
        assert_eq!(fresh.next_upd_ts, MAX_TS_MS);
        assert!(fresh.reeval_fields.is_empty());

        assert!(
            tx.mark_asset_dirty(id, ReevalFields::of(RollupField::Health), 2_000)
                .await
                .unwrap()
        );
        tx.mark_asset_dirty(id, ReevalFields::of(RollupField::Status), 3_000)
            .await
            .unwrap();

        let asset = tx.lock_asset(id).await.unwrap().unwrap();
        assert_eq!(asset.next_upd_ts, 2_000);
        assert!(asset.reeval_fields.contains(RollupField::Health));
        assert!(asset.reeval_fields.contains(RollupField::Status));
        assert!(!asset.reeval_fields.contains(RollupField::CurrState));

        assert!(
            !tx.mark_asset_dirty(9_999, ReevalFields::ALL, 0)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_save_device_round_trips_json_and_grades() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let id = tx
            .insert_device(&NewDevice {
                dev_ui: "AB-01".into(),
                name: "Meter".into(),
                parent_id: None,
                created_ts: 0,
            })
            .await
            .unwrap();

        assert_eq!(tx.find_device_id("ab-01").await.unwrap(), Some(id));
        assert_eq!(tx.find_device_id("AB-01").await.unwrap(), None);
        let mut device = tx.lock_device(id).await.unwrap().unwrap();
        assert_eq!(device.dev_ui, "ab-01");
        device.msg_health = HealthGrade::Warning;
        device.health = HealthGrade::Warning;
        device.warnings = json!({"Low battery": {"ts": 5}});
        tx.save_device(&device).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let loaded = tx.lock_device(id).await.unwrap().unwrap();
        assert_eq!(loaded, device);
    }

    #[tokio::test]
    async fn test_due_datastreams_skip_disabled_and_unscheduled() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let device_id = tx
            .insert_device(&NewDevice {
                dev_ui: "d1".into(),
                name: "d1".into(),
                parent_id: None,
                created_ts: 0,
            })
            .await
            .unwrap();

        let mut ids = Vec::new();
        for (name, enabled, time_update) in [
            ("t", true, Some(1_000)),
            ("off", false, Some(1_000)),
            ("manual", true, None),
        ] {
            let id = tx
                .insert_datastream(&NewDatastream {
                    device_id,
                    name: name.into(),
                    is_enabled: enabled,
                    is_value_integer: false,
                    time_update,
                    time_nd_health_error: 10_000,
                    created_ts: 0,
                })
                .await
                .unwrap();
            ids.push(id);
        }

        let due = tx.lock_due_datastreams(0, 10).await.unwrap();
        assert_eq!(due.iter().map(|d| d.id).collect::<Vec<_>>(), vec![ids[0]]);

        let enabled = tx.enabled_datastreams(device_id).await.unwrap();
        assert_eq!(enabled.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_df_reading_rolls_back_to_savepoint() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let app_id = insert_app(&mut tx, None).await;
        let feed_id = tx
            .insert_datafeed(&NewDatafeed {
                app_id,
                name: "Status".into(),
                datastream_id: None,
                is_value_integer: true,
            })
            .await
            .unwrap();

        tx.insert_df_readings(feed_id, &[Reading::new(1_000, 1.0)])
            .await
            .unwrap();

        tx.savepoint("app_exec").await.unwrap();
        tx.insert_df_readings(feed_id, &[Reading::new(2_000, 2.0)])
            .await
            .unwrap();
        let err = tx
            .insert_df_readings(feed_id, &[Reading::new(1_000, 5.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReading { series_id } if series_id == feed_id));
        tx.rollback_to_savepoint("app_exec").await.unwrap();
        tx.release_savepoint("app_exec").await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let readings = tx
            .list_df_readings(feed_id, &ReadingRange::default())
            .await
            .unwrap();
        assert_eq!(readings, vec![Reading::new(1_000, 1.0)]);
    }

    #[tokio::test]
    async fn test_ds_readings_range_and_skip_duplicates() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let device_id = tx
            .insert_device(&NewDevice {
                dev_ui: "d2".into(),
                name: "d2".into(),
                parent_id: None,
                created_ts: 0,
            })
            .await
            .unwrap();
        let ds_id = tx
            .insert_datastream(&NewDatastream {
                device_id,
                name: "Temperature".into(),
                is_enabled: true,
                is_value_integer: false,
                time_update: Some(1_000),
                time_nd_health_error: 10_000,
                created_ts: 0,
            })
            .await
            .unwrap();

        let readings: Vec<_> = (1..=5).map(|i| Reading::new(i * 100, i as f64)).collect();
        let n = tx
            .insert_ds_readings(ds_id, ReadingKind::Valid, &readings, true)
            .await
            .unwrap();
        assert_eq!(n, 5);

        let n = tx
            .insert_ds_readings(
                ds_id,
                ReadingKind::Valid,
                &[Reading::new(300, 99.0), Reading::new(600, 6.0)],
                true,
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        let range = ReadingRange {
            gt: Some(400),
            gte: Some(200),
            lte: Some(500),
            limit: None,
        };
        let times: Vec<_> = tx
            .list_ds_readings(ds_id, ReadingKind::Valid, &range)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.time)
            .collect();
        assert_eq!(times, vec![200, 300, 400, 500]);

        let first = tx
            .list_ds_readings(
                ds_id,
                ReadingKind::Valid,
                &ReadingRange::default().with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(first, vec![Reading::new(100, 1.0)]);

        let invalid = tx
            .list_ds_readings(ds_id, ReadingKind::Invalid, &ReadingRange::default())
            .await
            .unwrap();
        assert!(invalid.is_empty());
    }

    #[tokio::test]
    async fn test_application_schedule_and_children() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let asset_id = tx
            .insert_asset(&NewAsset {
                name: "plant".into(),
                parent_id: None,
                created_ts: 0,
            })
            .await
            .unwrap();
        let app_id = insert_app(&mut tx, Some(asset_id)).await;
        tx.insert_device(&NewDevice {
            dev_ui: "d3".into(),
            name: "d3".into(),
            parent_id: Some(asset_id),
            created_ts: 0,
        })
        .await
        .unwrap();

        let app = tx.lock_application(app_id).await.unwrap().unwrap();
        assert_eq!(app.func_name, "monitoring");
        assert!(app.has_status());
        assert!(!app.has_curr_state());
        assert_eq!(app.health, HealthGrade::Undefined);

        let schedule = tx.lock_app_schedule(app_id).await.unwrap().unwrap();
        assert_eq!(schedule.next_run_ts, 100);
        assert_eq!(schedule.interval_ms, app.invoc_interval_ms);

        assert!(tx.due_app_schedules(99, 10).await.unwrap().is_empty());
        assert_eq!(tx.due_app_schedules(100, 10).await.unwrap(), vec![schedule]);

        let children = tx.asset_children(asset_id).await.unwrap();
        assert_eq!(children.applications.len(), 1);
        assert_eq!(children.devices.len(), 1);
        assert!(children.assets.is_empty());
    }

    #[tokio::test]
    async fn test_delete_asset_detaches_children() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let parent = tx
            .insert_asset(&NewAsset {
                name: "parent".into(),
                parent_id: None,
                created_ts: 0,
            })
            .await
            .unwrap();
        let child = tx
            .insert_asset(&NewAsset {
                name: "child".into(),
                parent_id: Some(parent),
                created_ts: 0,
            })
            .await
            .unwrap();

        assert!(tx.delete_asset(parent).await.unwrap());
        assert!(!tx.delete_asset(parent).await.unwrap());

        let child = tx.lock_asset(child).await.unwrap().unwrap();
        assert_eq!(child.parent_id, None);
    }

    #[tokio::test]
    async fn test_delete_application_cascades() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let app_id = insert_app(&mut tx, None).await;
        let feed_id = tx
            .insert_datafeed(&NewDatafeed {
                app_id,
                name: "Derived".into(),
                datastream_id: None,
                is_value_integer: false,
            })
            .await
            .unwrap();
        tx.insert_df_readings(feed_id, &[Reading::new(1, 1.0)])
            .await
            .unwrap();

        assert!(tx.delete_application(app_id).await.unwrap());
        assert!(tx.lock_app_schedule(app_id).await.unwrap().is_none());
        assert!(tx.lock_datafeeds(app_id).await.unwrap().is_empty());
        assert!(
            tx.list_df_readings(feed_id, &ReadingRange::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_from_path_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("monapps.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        assert!(store.health_check().await.unwrap());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_invalid_savepoint_name_is_rejected() {
        let store = test_store().await;
        let mut tx = store.begin().await.unwrap();
        let err = tx.savepoint("bad name").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSavepoint(_)));
    }
}
