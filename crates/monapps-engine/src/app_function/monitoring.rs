// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `monitoring` 0.0.1: moves the cursor over native data and nothing else.

use super::{AppContext, AppFuncError, AppFuncOutput, UpdateDirectives, floor_ts};

/// Advance the cursor to the latest resample boundary every native feed has
/// data for. Reports catching up while any native window was cut short.
pub fn monitoring_0_0_1(ctx: &AppContext) -> Result<AppFuncOutput, AppFuncError> {
    let start = ctx.app.cursor_ts;
    if ctx.native.is_empty() {
        return Ok(AppFuncOutput::default());
    }

    let covered = ctx
        .native
        .values()
        .map(|feed| feed.readings.last().map_or(start, |r| r.time))
        .min()
        .unwrap_or(start);

    let end = floor_ts(covered, ctx.app.time_resample).max(start);
    let is_catching_up = ctx.native.values().any(|feed| feed.truncated);

    Ok(AppFuncOutput::with_directives(UpdateDirectives {
        cursor_ts: Some(end),
        is_catching_up: Some(is_catching_up),
        ..UpdateDirectives::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_function::NativeFeed;
    use monapps_core::model::{Application, Datafeed, HealthGrade, Reading};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn app(cursor_ts: i64) -> Application {
        Application {
            id: 1,
            type_id: 1,
            type_name: "monitoring".into(),
            func_name: "monitoring".into(),
            df_schema: json!({}),
            func_version: "0.0.1".into(),
            time_resample: 1_000,
            settings: json!({}),
            state: json!({}),
            errors: json!({}),
            warnings: json!({}),
            cursor_ts,
            is_enabled: true,
            is_catching_up: false,
            invoc_interval_ms: 60_000,
            catch_up_interval_ms: 5_000,
            status: None,
            curr_state: None,
            last_status_update_ts: None,
            last_curr_state_update_ts: None,
            time_status_stale: 600_000,
            time_curr_state_stale: 600_000,
            is_status_stale: false,
            is_curr_state_stale: false,
            health: HealthGrade::Undefined,
            time_health_error: 3_600_000,
            parent_id: None,
            created_ts: 0,
        }
    }

    fn feed(name: &str, times: &[i64], truncated: bool) -> (String, NativeFeed) {
        (
            name.to_string(),
            NativeFeed {
                feed: Datafeed {
                    id: 1,
                    app_id: 1,
                    name: name.to_string(),
                    datastream_id: Some(1),
                    is_value_integer: false,
                    last_reading_ts: None,
                },
                readings: times.iter().map(|t| Reading::new(*t, 1.0)).collect(),
                truncated,
            },
        )
    }

    fn ctx(cursor_ts: i64, native: Vec<(String, NativeFeed)>) -> AppContext {
        AppContext {
            app: app(cursor_ts),
            native: native.into_iter().collect::<BTreeMap<_, _>>(),
            derived: BTreeMap::new(),
            now_ms: 100_000,
        }
    }

    #[test]
    fn test_cursor_moves_to_common_floored_time() {
        let ctx = ctx(
            0,
            vec![
                feed("a", &[1_500, 4_200], false),
                feed("b", &[2_000, 3_700], false),
            ],
        );
        let out = run(&ctx);
        assert_eq!(out.directives.cursor_ts, Some(3_000));
        assert_eq!(out.directives.is_catching_up, Some(false));
        assert!(out.derived_readings.is_empty());
    }

    #[test]
    fn test_feed_without_data_holds_cursor() {
        let ctx = ctx(
            2_000,
            vec![feed("a", &[5_000], false), feed("b", &[], false)],
        );
        assert_eq!(run(&ctx).directives.cursor_ts, Some(2_000));
    }

    #[test]
    fn test_truncated_window_reports_catching_up() {
        let ctx = ctx(0, vec![feed("a", &[1_000, 2_000], true)]);
        let out = run(&ctx);
        assert_eq!(out.directives.cursor_ts, Some(2_000));
        assert_eq!(out.directives.is_catching_up, Some(true));
    }

    #[test]
    fn test_no_native_feeds_is_a_no_op() {
        let ctx = ctx(0, vec![]);
        assert_eq!(run(&ctx), AppFuncOutput::default());
    }

    fn run(ctx: &AppContext) -> AppFuncOutput {
        monitoring_0_0_1(ctx).unwrap()
    }
}
