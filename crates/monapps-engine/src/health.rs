// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health and staleness rules.
//!
//! Pure functions over entity rows and `now`. Every aggregate health is the
//! worst of its sources, so nothing here can report a better grade than one
//! of its inputs.

use monapps_core::model::{Application, Datastream, Field, HealthGrade, Tracked};
use serde_json::Value;

/// No-data health of a datastream.
///
/// A datastream that never reported is measured from its creation time and
/// stays `Undefined` until the silence threshold is crossed.
pub fn nd_health(ds: &Datastream, now: i64) -> HealthGrade {
    let since = ds.last_reading_ts.unwrap_or(ds.created_ts);
    if now - since > ds.time_nd_health_error {
        HealthGrade::Error
    } else if ds.last_reading_ts.is_some() {
        HealthGrade::Ok
    } else {
        HealthGrade::Undefined
    }
}

/// Next no-data evaluation time of a datastream.
pub fn next_eval_ts(ds: &Datastream, now: i64, eval_interval_ms: i64, margin_coef: f64) -> i64 {
    let expected = ds
        .time_update
        .map(|t| (t as f64 * margin_coef).round() as i64)
        .unwrap_or(0);
    now + eval_interval_ms.max(expected)
}

/// Recompute `nd_health` and `health` of a datastream. Returns whether
/// `health` changed.
pub fn refresh_datastream_health(ds: &mut Tracked<Datastream>, now: i64) -> bool {
    let nd = nd_health(ds, now);
    ds.set(Field::NdHealth, |d| &mut d.nd_health, nd);
    let health = HealthGrade::worst([ds.msg_health, ds.nd_health]);
    ds.set(Field::Health, |d| &mut d.health, health)
}

/// Whether a signal last updated at `last_update_ts` is stale at `now`.
///
/// A signal that was never updated ages from `created_ts`.
pub fn is_stale(last_update_ts: Option<i64>, created_ts: i64, now: i64, threshold: i64) -> bool {
    now - last_update_ts.unwrap_or(created_ts) > threshold
}

/// Health derived from how far the application's cursor lags behind `now`.
///
/// Only meaningful while the application runs normally; disabled or
/// catching-up applications get `Undefined`.
pub fn cursor_health(app: &Application, now: i64) -> HealthGrade {
    if !app.is_enabled || app.is_catching_up {
        HealthGrade::Undefined
    } else if now - app.cursor_ts > app.time_health_error {
        HealthGrade::Error
    } else {
        HealthGrade::Ok
    }
}

/// Health an application function reported about itself. Functions can only
/// report degradation, so `Ok` counts as no report.
pub fn reported_health(grade: Option<HealthGrade>) -> HealthGrade {
    match grade {
        None | Some(HealthGrade::Ok) => HealthGrade::Undefined,
        Some(grade) => grade,
    }
}

/// Message health of a device from its active alarm maps.
pub fn msg_health_from_alarms(errors: &Value, warnings: &Value) -> HealthGrade {
    if has_alarms(errors) {
        HealthGrade::Error
    } else if has_alarms(warnings) {
        HealthGrade::Warning
    } else {
        HealthGrade::Ok
    }
}

fn has_alarms(map: &Value) -> bool {
    match map {
        Value::Object(map) => !map.is_empty(),
        Value::Array(list) => !list.is_empty(),
        Value::Null => false,
        _ => true,
    }
}
