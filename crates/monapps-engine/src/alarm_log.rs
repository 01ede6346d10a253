// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User-facing alarm log.
//!
//! Entries go to the `alarm_log` tracing target, separate from the
//! operational logs of the jobs, so a subscriber can route them elsewhere.

use chrono::{DateTime, Utc};
use monapps_core::model::Entity;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// Severity of an alarm log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmLevel {
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

impl AlarmLevel {
    /// Upper-case label.
    pub const fn as_str(self) -> &'static str {
        match self {
            AlarmLevel::Info => "INFO",
            AlarmLevel::Warning => "WARNING",
            AlarmLevel::Error => "ERROR",
        }
    }
}

/// `"<entity type> <id>"`, the identity used in alarm entries and payloads.
pub fn full_id<E: Entity>(entity: &E) -> String {
    format!("{} {}", E::TYPE_NAME, entity.id())
}

/// Append an entry for `entity` stamped at `ts`.
pub fn record<E: Entity>(level: AlarmLevel, entity: &E, ts: i64, msg: &str) {
    record_for(level, &full_id(entity), ts, msg);
}

/// Append an entry for an arbitrary source.
pub fn record_for(level: AlarmLevel, source: &str, ts: i64, msg: &str) {
    let at = DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y/%m/%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string());
    match level {
        AlarmLevel::Info => {
            info!(target: "alarm_log", level = level.as_str(), entity = source, ts, at = %at, "{msg}")
        }
        AlarmLevel::Warning => {
            warn!(target: "alarm_log", level = level.as_str(), entity = source, ts, at = %at, "{msg}")
        }
        AlarmLevel::Error => {
            error!(target: "alarm_log", level = level.as_str(), entity = source, ts, at = %at, "{msg}")
        }
    }
}

/// Merge the alarms reported at `ts` into a stored alarm map.
///
/// Maps are keyed by alarm name. An incoming entry replaces the stored one
/// when its content differs and is stamped with `ts`; an unchanged entry keeps
/// the stamp of its last change. Stored alarms absent from `incoming` stay.
pub fn merge_alarms(stored: &Value, incoming: Option<&Value>, ts: i64) -> Value {
    let mut merged = match stored {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let Some(Value::Object(incoming)) = incoming else {
        return Value::Object(merged);
    };

    for (name, payload) in incoming {
        let mut entry = match payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other.clone())]),
        };
        entry.remove("ts");

        let unchanged = merged.get(name).is_some_and(|current| {
            let mut current = current.as_object().cloned().unwrap_or_default();
            current.remove("ts");
            current == entry
        });
        if unchanged {
            continue;
        }

        entry.insert("ts".into(), Value::from(ts));
        merged.insert(name.clone(), Value::Object(entry));
    }
    Value::Object(merged)
}
