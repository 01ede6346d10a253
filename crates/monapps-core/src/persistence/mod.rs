// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for monapps-core.
//!
//! Every job works inside one [`StoreTx`]. Rows selected through the `lock_*`
//! methods stay locked until the transaction ends, so a read-modify-write
//! cycle on them is safe against concurrent jobs.
//!
//! | Backend | Locking |
//! |---------|---------|
//! | [`PostgresStore`] | `SELECT ... FOR UPDATE` |
//! | [`SqliteStore`] | one pooled connection, transactions run one at a time |

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::QueryBuilder;

use crate::error::Result;
use crate::model::{
    AppSchedule, AppType, Application, Asset, Datafeed, Datastream, Device, Reading, ReadingKind,
    ReadingRange, ReevalFields,
};

/// Entry point to a backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool>;
}

/// Children of an asset, as seen by the asset rollup.
#[derive(Debug, Clone, Default)]
pub struct AssetChildren {
    /// Applications attached to the asset.
    pub applications: Vec<Application>,
    /// Devices attached to the asset.
    pub devices: Vec<Device>,
    /// Child assets.
    pub assets: Vec<Asset>,
}

impl AssetChildren {
    /// True when the asset has no children at all.
    pub fn is_empty(&self) -> bool {
        self.applications.is_empty() && self.devices.is_empty() && self.assets.is_empty()
    }
}

/// One open transaction.
#[async_trait]
pub trait StoreTx: Send {
    // ------------------------------------------------------------------
    // Transaction control
    // ------------------------------------------------------------------

    /// Commit and release all locks.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back and release all locks.
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Open a named savepoint. Names must be `[a-z_]+`.
    async fn savepoint(&mut self, name: &str) -> Result<()>;

    /// Undo everything since the savepoint. The savepoint stays open.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    /// Forget a savepoint, keeping its changes.
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Due selection
    //
    // The batch is the `limit` oldest due rows, locked and returned in id
    // order. Every multi-row lock on a table goes by id so sweeps and
    // ingestion cannot deadlock on each other.
    // ------------------------------------------------------------------

    /// Enabled datastreams with an update period whose health evaluation is due.
    async fn lock_due_datastreams(&mut self, now: i64, limit: i64) -> Result<Vec<Datastream>>;

    /// Devices whose `next_upd_ts` has passed.
    async fn lock_due_devices(&mut self, now: i64, limit: i64) -> Result<Vec<Device>>;

    /// Assets whose `next_upd_ts` has passed.
    async fn lock_due_assets(&mut self, now: i64, limit: i64) -> Result<Vec<Asset>>;

    /// Enabled schedules whose `next_run_ts` has passed. Not locked: the
    /// executor locks each one in its own transaction.
    async fn due_app_schedules(&mut self, now: i64, limit: i64) -> Result<Vec<AppSchedule>>;

    // ------------------------------------------------------------------
    // Single rows (locked)
    // ------------------------------------------------------------------

    /// Lock an asset.
    async fn lock_asset(&mut self, id: i64) -> Result<Option<Asset>>;

    /// Lock a device.
    async fn lock_device(&mut self, id: i64) -> Result<Option<Device>>;

    /// Resolve a device id from its ingestion identifier without locking.
    async fn find_device_id(&mut self, dev_ui: &str) -> Result<Option<i64>>;

    /// Lock a datastream.
    async fn lock_datastream(&mut self, id: i64) -> Result<Option<Datastream>>;

    /// Lock every datastream of a device, in id order.
    async fn lock_datastreams_of_device(&mut self, device_id: i64) -> Result<Vec<Datastream>>;

    /// Lock an application.
    async fn lock_application(&mut self, id: i64) -> Result<Option<Application>>;

    /// Lock the schedule row of an application.
    async fn lock_app_schedule(&mut self, app_id: i64) -> Result<Option<AppSchedule>>;

    /// Lock every datafeed of an application.
    async fn lock_datafeeds(&mut self, app_id: i64) -> Result<Vec<Datafeed>>;

    // ------------------------------------------------------------------
    // Child lookups
    // ------------------------------------------------------------------

    /// Enabled datastreams of a device.
    async fn enabled_datastreams(&mut self, device_id: i64) -> Result<Vec<Datastream>>;

    /// Applications, devices and assets attached to an asset.
    async fn asset_children(&mut self, asset_id: i64) -> Result<AssetChildren>;

    /// Load an app type.
    async fn app_type(&mut self, id: i64) -> Result<Option<AppType>>;

    // ------------------------------------------------------------------
    // Dirty marks
    // ------------------------------------------------------------------

    /// Add `fields` to the asset's pending set and pull its due time down to
    /// `due_ts` if earlier. Returns whether the asset exists.
    async fn mark_asset_dirty(
        &mut self,
        asset_id: i64,
        fields: ReevalFields,
        due_ts: i64,
    ) -> Result<bool>;

    /// Pull the device's due time down to `due_ts` if earlier.
    async fn mark_device_dirty(&mut self, device_id: i64, due_ts: i64) -> Result<bool>;

    // ------------------------------------------------------------------
    // Saves (all mutable columns)
    // ------------------------------------------------------------------

    /// Persist an asset.
    async fn save_asset(&mut self, asset: &Asset) -> Result<()>;

    /// Persist a device.
    async fn save_device(&mut self, device: &Device) -> Result<()>;

    /// Persist a datastream.
    async fn save_datastream(&mut self, datastream: &Datastream) -> Result<()>;

    /// Persist an application.
    async fn save_application(&mut self, app: &Application) -> Result<()>;

    /// Persist a schedule.
    async fn save_app_schedule(&mut self, schedule: &AppSchedule) -> Result<()>;

    /// Persist a datafeed.
    async fn save_datafeed(&mut self, feed: &Datafeed) -> Result<()>;

    // ------------------------------------------------------------------
    // Readings
    // ------------------------------------------------------------------

    /// Bulk insert derived readings. An existing `(feed, time)` fails the
    /// whole insert with [`crate::StoreError::DuplicateReading`].
    async fn insert_df_readings(&mut self, feed_id: i64, readings: &[Reading]) -> Result<u64>;

    /// Bulk insert datastream readings of one kind. With `skip_duplicates`
    /// existing times are left alone instead of failing.
    async fn insert_ds_readings(
        &mut self,
        datastream_id: i64,
        kind: ReadingKind,
        readings: &[Reading],
        skip_duplicates: bool,
    ) -> Result<u64>;

    /// Derived readings in a range, oldest first.
    async fn list_df_readings(&mut self, feed_id: i64, range: &ReadingRange)
    -> Result<Vec<Reading>>;

    /// Datastream readings of one kind in a range, oldest first.
    async fn list_ds_readings(
        &mut self,
        datastream_id: i64,
        kind: ReadingKind,
        range: &ReadingRange,
    ) -> Result<Vec<Reading>>;

    // ------------------------------------------------------------------
    // Provisioning and removal
    // ------------------------------------------------------------------

    /// Create an asset.
    async fn insert_asset(&mut self, new: &NewAsset) -> Result<i64>;

    /// Create a device.
    async fn insert_device(&mut self, new: &NewDevice) -> Result<i64>;

    /// Create a datastream, due for evaluation immediately.
    async fn insert_datastream(&mut self, new: &NewDatastream) -> Result<i64>;

    /// Create an app type.
    async fn insert_app_type(&mut self, new: &NewAppType) -> Result<i64>;

    /// Create an application together with its schedule row.
    async fn insert_application(&mut self, new: &NewApplication) -> Result<i64>;

    /// Create a datafeed.
    async fn insert_datafeed(&mut self, new: &NewDatafeed) -> Result<i64>;

    /// Delete an asset. Children are detached.
    async fn delete_asset(&mut self, id: i64) -> Result<bool>;

    /// Delete a device and its datastreams.
    async fn delete_device(&mut self, id: i64) -> Result<bool>;

    /// Delete a datastream and its readings.
    async fn delete_datastream(&mut self, id: i64) -> Result<bool>;

    /// Delete an application, its schedule, datafeeds and derived readings.
    async fn delete_application(&mut self, id: i64) -> Result<bool>;
}

/// Savepoint names are interpolated into SQL.
pub(crate) fn check_savepoint_name(name: &str) -> Result<()> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
        Ok(())
    } else {
        Err(crate::StoreError::InvalidSavepoint(name.to_string()))
    }
}

/// Bound rows per bulk insert statement; four binds per row keeps both
/// backends under their bind-parameter limits.
pub(crate) const INSERT_CHUNK: usize = 5_000;

pub(crate) const ASSET_COLUMNS: &str = "id, name, parent_id, status, curr_state, health, \
    is_status_stale, is_curr_state_stale, last_status_update_ts, last_curr_state_update_ts, \
    reeval_fields, next_upd_ts, created_ts";

pub(crate) const DEVICE_COLUMNS: &str = "id, dev_ui, name, parent_id, msg_health, chld_health, \
    health, errors, warnings, next_upd_ts, created_ts";

pub(crate) const DATASTREAM_COLUMNS: &str = "id, device_id, name, is_enabled, is_value_integer, \
    msg_health, nd_health, health, last_reading_ts, health_next_eval_ts, time_update, \
    time_nd_health_error, created_ts";

pub(crate) const DATAFEED_COLUMNS: &str =
    "id, app_id, name, datastream_id, is_value_integer, last_reading_ts";

pub(crate) const SCHEDULE_COLUMNS: &str = "app_id, interval_ms, next_run_ts, is_enabled";

/// Applications are always loaded with their type joined in as `t`.
pub(crate) const APPLICATION_SELECT: &str = "SELECT a.id, a.type_id, t.name AS type_name, \
    t.func_name, t.df_schema, a.func_version, a.time_resample, a.settings, a.state, a.errors, \
    a.warnings, a.cursor_ts, a.is_enabled, a.is_catching_up, a.invoc_interval_ms, \
    a.catch_up_interval_ms, a.status, a.curr_state, a.last_status_update_ts, \
    a.last_curr_state_update_ts, a.time_status_stale, a.time_curr_state_stale, \
    a.is_status_stale, a.is_curr_state_stale, a.health, a.time_health_error, a.parent_id, \
    a.created_ts FROM applications a JOIN app_types t ON t.id = a.type_id";

/// Append the `time` filters, ordering and limit of `range`.
pub(crate) fn push_range<'args, DB>(qb: &mut QueryBuilder<'args, DB>, range: &ReadingRange)
where
    DB: sqlx::Database,
    i64: sqlx::Encode<'args, DB> + sqlx::Type<DB>,
{
    match range.lower_bound() {
        Some((ts, true)) => {
            qb.push(" AND time >= ").push_bind(ts);
        }
        Some((ts, false)) => {
            qb.push(" AND time > ").push_bind(ts);
        }
        None => {}
    }
    if let Some(lte) = range.lte {
        qb.push(" AND time <= ").push_bind(lte);
    }
    qb.push(" ORDER BY time");
    if let Some(limit) = range.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
}

// ============================================================================
// Provisioning records
// ============================================================================

/// New asset.
#[derive(Debug, Clone)]
pub struct NewAsset {
    /// Display name.
    pub name: String,
    /// Parent asset.
    pub parent_id: Option<i64>,
    /// Creation time.
    pub created_ts: i64,
}

/// New device.
#[derive(Debug, Clone)]
pub struct NewDevice {
    /// Ingestion identifier, stored lower-cased.
    pub dev_ui: String,
    /// Display name.
    pub name: String,
    /// Owning asset.
    pub parent_id: Option<i64>,
    /// Creation time.
    pub created_ts: i64,
}

/// New datastream.
#[derive(Debug, Clone)]
pub struct NewDatastream {
    /// Owning device.
    pub device_id: i64,
    /// Channel name.
    pub name: String,
    /// Whether the channel is active.
    pub is_enabled: bool,
    /// Round values on ingestion.
    pub is_value_integer: bool,
    /// Expected reporting period.
    pub time_update: Option<i64>,
    /// Silence threshold for no-data errors.
    pub time_nd_health_error: i64,
    /// Creation time.
    pub created_ts: i64,
}

/// New app type.
#[derive(Debug, Clone)]
pub struct NewAppType {
    /// Unique name.
    pub name: String,
    /// Registry key of the function.
    pub func_name: String,
    /// Feed schema.
    pub df_schema: Value,
}

/// New application.
#[derive(Debug, Clone)]
pub struct NewApplication {
    /// Application type.
    pub type_id: i64,
    /// Function version.
    pub func_version: String,
    /// Resampling window.
    pub time_resample: i64,
    /// Settings map.
    pub settings: Value,
    /// Start cursor.
    pub cursor_ts: i64,
    /// Whether the application runs.
    pub is_enabled: bool,
    /// Normal invocation interval.
    pub invoc_interval_ms: i64,
    /// Catch-up invocation interval.
    pub catch_up_interval_ms: i64,
    /// Status staleness threshold.
    pub time_status_stale: i64,
    /// Current-state staleness threshold.
    pub time_curr_state_stale: i64,
    /// Cursor lag threshold.
    pub time_health_error: i64,
    /// Owning asset.
    pub parent_id: Option<i64>,
    /// Creation time; also the first scheduled run.
    pub created_ts: i64,
}

impl NewApplication {
    /// Application with the usual production defaults.
    pub fn new(type_id: i64, func_version: impl Into<String>, created_ts: i64) -> Self {
        Self {
            type_id,
            func_version: func_version.into(),
            time_resample: 60_000,
            settings: Value::Object(Default::default()),
            cursor_ts: 0,
            is_enabled: true,
            invoc_interval_ms: 60_000,
            catch_up_interval_ms: 5_000,
            time_status_stale: 600_000,
            time_curr_state_stale: 600_000,
            time_health_error: 3_600_000,
            parent_id: None,
            created_ts,
        }
    }
}

/// New datafeed.
#[derive(Debug, Clone)]
pub struct NewDatafeed {
    /// Owning application.
    pub app_id: i64,
    /// Feed name.
    pub name: String,
    /// Backing datastream; `None` for derived feeds.
    pub datastream_id: Option<i64>,
    /// Integer-valued feed.
    pub is_value_integer: bool,
}
