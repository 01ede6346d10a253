// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `fake_data_generator` 0.0.1: synthetic status and current state for
//! exercising the rollup and failure paths end to end.
//!
//! Every draw is a hash of the application id, the resampled invocation time
//! and a per-draw salt, so an invocation is reproducible.
//!
//! Settings (all probabilities in `0..=1`, default `0.5`):
//! - `prob_exception`: chance the invocation fails.
//! - `prob_status_calc_omitted`: chance no status is produced.
//! - `prob_curr_state_calc_omitted`: chance no current state is produced.

use monapps_core::model::{CURR_STATE_FEED, Reading, STATUS_FEED};
use serde_json::Value;

use super::{AppContext, AppFuncError, AppFuncOutput, UpdateDirectives, floor_ts};

const DEFAULT_PROBABILITY: f64 = 0.5;

/// Highest generated signal value.
const MAX_VALUE: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
enum Draw {
    Exception = 1,
    StatusOmitted,
    StatusValue,
    CurrStateOmitted,
    CurrStateValue,
}

/// Emit one status and one current-state reading at the resampled
/// invocation time, each possibly omitted, or fail outright.
pub fn fake_data_generator_0_0_1(ctx: &AppContext) -> Result<AppFuncOutput, AppFuncError> {
    let app = &ctx.app;
    for name in [STATUS_FEED, CURR_STATE_FEED] {
        if !ctx.derived.contains_key(name) {
            return Err(AppFuncError::Failed(format!(
                "derived feed {name:?} is missing"
            )));
        }
    }

    let rts = floor_ts(ctx.now_ms, app.time_resample);
    let draw = |d: Draw| unit_draw(app.id, rts, d as u64);

    if draw(Draw::Exception) < probability(&app.settings, "prob_exception") {
        return Err(AppFuncError::Failed("generated failure".to_string()));
    }

    let mut output = AppFuncOutput::with_directives(UpdateDirectives {
        cursor_ts: Some(rts),
        ..UpdateDirectives::default()
    });

    // Invoked again inside the same resample step: that slot is written.
    if rts == app.cursor_ts {
        return Ok(output);
    }

    let signals = [
        (
            STATUS_FEED,
            "prob_status_calc_omitted",
            Draw::StatusOmitted,
            Draw::StatusValue,
        ),
        (
            CURR_STATE_FEED,
            "prob_curr_state_calc_omitted",
            Draw::CurrStateOmitted,
            Draw::CurrStateValue,
        ),
    ];
    for (feed, setting, omitted, value) in signals {
        if draw(omitted) < probability(&app.settings, setting) {
            continue;
        }
        let value = (draw(value) * (MAX_VALUE + 1.0)).floor().min(MAX_VALUE);
        output
            .derived_readings
            .insert(feed.to_string(), vec![Reading::new(rts, value)]);
    }

    Ok(output)
}

fn probability(settings: &Value, key: &str) -> f64 {
    settings
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_PROBABILITY)
        .clamp(0.0, 1.0)
}

/// Uniform value in `[0, 1)` (splitmix64 finaliser).
fn unit_draw(app_id: i64, ts: i64, salt: u64) -> f64 {
    let mut z = (app_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (ts as u64).rotate_left(17)
        ^ salt.wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
