// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity rows as loaded from the store.

use serde::Serialize;
use serde_json::Value;

use super::health::{HealthGrade, ReevalFields};
use super::tracked::Field;

/// Datafeed name that carries an application's status.
pub const STATUS_FEED: &str = "Status";
/// Datafeed name that carries an application's current state.
pub const CURR_STATE_FEED: &str = "Current state";

/// Metadata shared by everything that can be published.
pub trait Entity: Serialize {
    /// Type name used in topics and ids, e.g. `"asset"`.
    const TYPE_NAME: &'static str;

    /// Row id.
    fn id(&self) -> i64;

    /// Owning asset, if any.
    fn parent_id(&self) -> Option<i64>;

    /// Serialized value of a single field, `None` when the entity does not have it.
    fn field_value(&self, field: Field) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove(field.camel_name()),
            _ => None,
        }
    }
}

/// Node of the asset tree.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    /// Row id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Parent asset.
    pub parent_id: Option<i64>,
    /// Worst status among contributing children.
    pub status: Option<i32>,
    /// Worst current state among contributing children.
    pub curr_state: Option<i32>,
    /// Worst health among all children.
    pub health: HealthGrade,
    /// All status contributors are stale.
    pub is_status_stale: bool,
    /// All current-state contributors are stale.
    pub is_curr_state_stale: bool,
    /// When `status` last changed.
    pub last_status_update_ts: Option<i64>,
    /// When `curr_state` last changed.
    pub last_curr_state_update_ts: Option<i64>,
    /// Fields pending recomputation.
    #[serde(skip)]
    pub reeval_fields: ReevalFields,
    /// When the next sweep should pick this asset up.
    #[serde(skip)]
    pub next_upd_ts: i64,
    /// Creation time.
    pub created_ts: i64,
}

impl Entity for Asset {
    const TYPE_NAME: &'static str = "asset";

    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        self.parent_id
    }
}

/// Physical device owning datastreams.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Row id.
    pub id: i64,
    /// Identifier used by ingestion, always lower-case.
    pub dev_ui: String,
    /// Display name.
    pub name: String,
    /// Owning asset.
    pub parent_id: Option<i64>,
    /// Health reported in device messages.
    pub msg_health: HealthGrade,
    /// Worst health of enabled datastreams.
    pub chld_health: HealthGrade,
    /// `max(msg_health, chld_health)`.
    pub health: HealthGrade,
    /// Latest error map reported by the device.
    #[sqlx(json)]
    pub errors: Value,
    /// Latest warning map reported by the device.
    #[sqlx(json)]
    pub warnings: Value,
    /// When the next sweep should pick this device up.
    #[serde(skip)]
    pub next_upd_ts: i64,
    /// Creation time.
    pub created_ts: i64,
}

impl Entity for Device {
    const TYPE_NAME: &'static str = "device";

    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        self.parent_id
    }
}

/// Native measurement channel of a device.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Datastream {
    /// Row id.
    pub id: i64,
    /// Owning device.
    pub device_id: i64,
    /// Channel name as it appears in device payloads.
    pub name: String,
    /// Disabled channels neither contribute to device health nor get evaluated.
    pub is_enabled: bool,
    /// Values are rounded when ingested.
    pub is_value_integer: bool,
    /// Health reported in device messages.
    pub msg_health: HealthGrade,
    /// Health derived from reading recency.
    pub nd_health: HealthGrade,
    /// `max(msg_health, nd_health)`.
    pub health: HealthGrade,
    /// Time of the newest valid reading.
    pub last_reading_ts: Option<i64>,
    /// When no-data health is evaluated next.
    #[serde(skip)]
    pub health_next_eval_ts: i64,
    /// Expected reporting period; channels without one are not evaluated.
    pub time_update: Option<i64>,
    /// Silence longer than this is an error.
    pub time_nd_health_error: i64,
    /// Creation time.
    pub created_ts: i64,
}

impl Entity for Datastream {
    const TYPE_NAME: &'static str = "datastream";

    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        None
    }
}

/// Kind of application and the feeds it works with.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AppType {
    /// Row id.
    pub id: i64,
    /// Unique type name.
    pub name: String,
    /// Registry key of the function implementing this type.
    pub func_name: String,
    /// `{feed name: {"datatype": ..., "derived": bool}}`.
    #[sqlx(json)]
    pub df_schema: Value,
}

impl AppType {
    /// Whether the schema declares the status feed.
    pub fn has_status(&self) -> bool {
        schema_declares(&self.df_schema, STATUS_FEED)
    }

    /// Whether the schema declares the current-state feed.
    pub fn has_curr_state(&self) -> bool {
        schema_declares(&self.df_schema, CURR_STATE_FEED)
    }
}

fn schema_declares(schema: &Value, feed: &str) -> bool {
    schema.get(feed).is_some()
}

/// Configured computation unit.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Row id.
    pub id: i64,
    /// Application type.
    pub type_id: i64,
    /// Name of the type, joined in.
    #[serde(skip)]
    pub type_name: String,
    /// Function registry key, joined in from the type.
    #[serde(skip)]
    pub func_name: String,
    /// Type schema, joined in.
    #[sqlx(json)]
    #[serde(skip)]
    pub df_schema: Value,
    /// Function version this application is pinned to.
    pub func_version: String,
    /// Resampling window handed to the function.
    pub time_resample: i64,
    /// Settings map, `{valid-from ts: {...}}`.
    #[sqlx(json)]
    #[serde(skip)]
    pub settings: Value,
    /// Opaque state carried between invocations.
    #[sqlx(json)]
    pub state: Value,
    /// Active errors keyed by alarm name.
    #[sqlx(json)]
    pub errors: Value,
    /// Active warnings keyed by alarm name.
    #[sqlx(json)]
    pub warnings: Value,
    /// Native data is incorporated up to here.
    pub cursor_ts: i64,
    /// Disabled applications are not executed.
    pub is_enabled: bool,
    /// Running on the catch-up schedule.
    pub is_catching_up: bool,
    /// Normal invocation interval.
    pub invoc_interval_ms: i64,
    /// Interval used while catching up.
    pub catch_up_interval_ms: i64,
    /// Latest status value.
    pub status: Option<i32>,
    /// Latest current-state value.
    pub curr_state: Option<i32>,
    /// Time of the reading that last set `status`.
    pub last_status_update_ts: Option<i64>,
    /// Time of the reading that last set `curr_state`.
    pub last_curr_state_update_ts: Option<i64>,
    /// Status older than this is stale.
    pub time_status_stale: i64,
    /// Current state older than this is stale.
    pub time_curr_state_stale: i64,
    /// Status is stale.
    pub is_status_stale: bool,
    /// Current state is stale.
    pub is_curr_state_stale: bool,
    /// Worst of exception, reported and cursor health.
    pub health: HealthGrade,
    /// A cursor lagging more than this is an error.
    pub time_health_error: i64,
    /// Owning asset.
    pub parent_id: Option<i64>,
    /// Creation time.
    pub created_ts: i64,
}

impl Application {
    /// Whether the type declares a status feed.
    pub fn has_status(&self) -> bool {
        schema_declares(&self.df_schema, STATUS_FEED)
    }

    /// Whether the type declares a current-state feed.
    pub fn has_curr_state(&self) -> bool {
        schema_declares(&self.df_schema, CURR_STATE_FEED)
    }

    /// Interval for the next run given the catching-up flag.
    pub fn active_interval_ms(&self) -> i64 {
        if self.is_catching_up {
            self.catch_up_interval_ms
        } else {
            self.invoc_interval_ms
        }
    }
}

impl Entity for Application {
    const TYPE_NAME: &'static str = "application";

    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        self.parent_id
    }
}

/// Periodic invocation row of an application.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AppSchedule {
    /// Application this schedule drives.
    pub app_id: i64,
    /// Interval currently in force.
    pub interval_ms: i64,
    /// Next due run.
    pub next_run_ts: i64,
    /// Disabled schedules are never picked up.
    pub is_enabled: bool,
}

/// Named series bound to an application.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Datafeed {
    /// Row id.
    pub id: i64,
    /// Owning application.
    pub app_id: i64,
    /// Name, unique within the application.
    pub name: String,
    /// Backing datastream for native feeds.
    pub datastream_id: Option<i64>,
    /// Values are integer-valued.
    pub is_value_integer: bool,
    /// Time of the newest reading.
    pub last_reading_ts: Option<i64>,
}

impl Datafeed {
    /// Native feeds read a datastream, derived feeds hold computed readings.
    pub fn is_native(&self) -> bool {
        self.datastream_id.is_some()
    }
}

impl Entity for Datafeed {
    const TYPE_NAME: &'static str = "datafeed";

    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        None
    }
}
