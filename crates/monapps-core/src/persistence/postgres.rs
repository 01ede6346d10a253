// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store.
//!
//! Every `lock_*` query ends in `FOR UPDATE`, so concurrent jobs touching the
//! same rows queue behind each other instead of overwriting each other's
//! read-modify-write cycles.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Transaction};
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

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::migrations::run_postgres(&pool).await?;
        info!(max_connections, "Connected to PostgreSQL store");
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

/// Open PostgreSQL transaction.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTx {
    async fn exec(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
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
                WHERE is_enabled AND time_update IS NOT NULL AND health_next_eval_ts <= $1
                ORDER BY health_next_eval_ts, id
                LIMIT $2
            )
            AND health_next_eval_ts <= $1
            ORDER BY id
            FOR UPDATE
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
                WHERE next_upd_ts <= $1
                ORDER BY next_upd_ts, id
                LIMIT $2
            )
            AND next_upd_ts <= $1
            ORDER BY id
            FOR UPDATE
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
                WHERE next_upd_ts <= $1
                ORDER BY next_upd_ts, id
                LIMIT $2
            )
            AND next_upd_ts <= $1
            ORDER BY id
            FOR UPDATE
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
            WHERE is_enabled AND next_run_ts <= $1
            ORDER BY next_run_ts
            LIMIT $2
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
            "SELECT {ASSET_COLUMNS} FROM assets WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_device(&mut self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_device_id(&mut self, dev_ui: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM devices WHERE dev_ui = $1")
            .bind(dev_ui)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn lock_datastream(&mut self, id: i64) -> Result<Option<Datastream>> {
        let row = sqlx::query_as::<_, Datastream>(&format!(
            "SELECT {DATASTREAM_COLUMNS} FROM datastreams WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_datastreams_of_device(&mut self, device_id: i64) -> Result<Vec<Datastream>> {
        let rows = sqlx::query_as::<_, Datastream>(&format!(
            "SELECT {DATASTREAM_COLUMNS} FROM datastreams WHERE device_id = $1 ORDER BY id FOR UPDATE"
        ))
        .bind(device_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn lock_application(&mut self, id: i64) -> Result<Option<Application>> {
        let row = sqlx::query_as::<_, Application>(&format!(
            "{APPLICATION_SELECT} WHERE a.id = $1 FOR UPDATE OF a"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_app_schedule(&mut self, app_id: i64) -> Result<Option<AppSchedule>> {
        let row = sqlx::query_as::<_, AppSchedule>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM app_schedules WHERE app_id = $1 FOR UPDATE"
        ))
        .bind(app_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_datafeeds(&mut self, app_id: i64) -> Result<Vec<Datafeed>> {
        let rows = sqlx::query_as::<_, Datafeed>(&format!(
            "SELECT {DATAFEED_COLUMNS} FROM datafeeds WHERE app_id = $1 ORDER BY id FOR UPDATE"
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
            "SELECT {DATASTREAM_COLUMNS} FROM datastreams WHERE device_id = $1 AND is_enabled ORDER BY id"
        ))
        .bind(device_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn asset_children(&mut self, asset_id: i64) -> Result<AssetChildren> {
        let applications = sqlx::query_as::<_, Application>(&format!(
            "{APPLICATION_SELECT} WHERE a.parent_id = $1 ORDER BY a.id"
        ))
        .bind(asset_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let devices = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE parent_id = $1 ORDER BY id"
        ))
        .bind(asset_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let assets = sqlx::query_as::<_, Asset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE parent_id = $1 ORDER BY id"
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
            "SELECT id, name, func_name, df_schema FROM app_types WHERE id = $1",
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
            SET reeval_fields = reeval_fields | $2,
                next_upd_ts = LEAST(next_upd_ts, $3)
            WHERE id = $1
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
            "UPDATE devices SET next_upd_ts = LEAST(next_upd_ts, $2) WHERE id = $1",
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
            SET status = $2,
                curr_state = $3,
                health = $4,
                is_status_stale = $5,
                is_curr_state_stale = $6,
                last_status_update_ts = $7,
                last_curr_state_update_ts = $8,
                reeval_fields = $9,
                next_upd_ts = $10
            WHERE id = $1
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
            SET msg_health = $2,
                chld_health = $3,
                health = $4,
                errors = $5,
                warnings = $6,
                next_upd_ts = $7
            WHERE id = $1
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
            SET is_enabled = $2,
                msg_health = $3,
                nd_health = $4,
                health = $5,
                last_reading_ts = $6,
                health_next_eval_ts = $7
            WHERE id = $1
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
            SET state = $2,
                errors = $3,
                warnings = $4,
                cursor_ts = $5,
                is_enabled = $6,
                is_catching_up = $7,
                status = $8,
                curr_state = $9,
                last_status_update_ts = $10,
                last_curr_state_update_ts = $11,
                is_status_stale = $12,
                is_curr_state_stale = $13,
                health = $14
            WHERE id = $1
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
            SET interval_ms = $2, next_run_ts = $3, is_enabled = $4
            WHERE app_id = $1
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
        sqlx::query("UPDATE datafeeds SET last_reading_ts = $2 WHERE id = $1")
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
            let mut qb = QueryBuilder::<Postgres>::new(
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
            let mut qb = QueryBuilder::<Postgres>::new(format!(
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
        let mut qb = QueryBuilder::<Postgres>::new(
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
        let mut qb = QueryBuilder::<Postgres>::new(format!(
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
            "INSERT INTO assets (name, parent_id, created_ts) VALUES ($1, $2, $3) RETURNING id",
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
            VALUES ($1, $2, $3, $4)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
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
            "INSERT INTO app_types (name, func_name, df_schema) VALUES ($1, $2, $3) RETURNING id",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
            VALUES ($1, $2, $3, TRUE)
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
            VALUES ($1, $2, $3, $4)
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
        let result = sqlx::query("DELETE FROM assets WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_device(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_datastream(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM datastreams WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_application(&mut self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
