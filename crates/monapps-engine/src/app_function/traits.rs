// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application function contract.
//!
//! Defines what a pluggable function sees and what it may return.

use std::collections::{BTreeMap, BTreeSet};

use monapps_core::model::{Application, Datafeed, HealthGrade, Reading};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from application functions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppFuncError {
    /// No function is registered under this name and version.
    #[error("Unknown application function: {name} {version}")]
    UnknownFunction {
        /// Function name from the app type.
        name: String,
        /// Version from the application.
        version: String,
    },

    /// The function returned something the executor cannot apply.
    #[error("Invalid function output: {0}")]
    InvalidOutput(String),

    /// The function reported a failure.
    #[error("Function failed: {0}")]
    Failed(String),

    /// The function panicked.
    #[error("Function panicked: {0}")]
    Panicked(String),
}

/// A native feed together with the readings handed to the function.
#[derive(Debug, Clone)]
pub struct NativeFeed {
    /// Feed row.
    pub feed: Datafeed,
    /// Valid datastream readings after the cursor, oldest first.
    pub readings: Vec<Reading>,
    /// More readings exist past the last one loaded.
    pub truncated: bool,
}

/// Everything a function invocation can see.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Application row as locked by the executor.
    pub app: Application,
    /// Channel-backed feeds by name.
    pub native: BTreeMap<String, NativeFeed>,
    /// Computed feeds by name.
    pub derived: BTreeMap<String, Datafeed>,
    /// Invocation time.
    pub now_ms: i64,
}

/// Alarms reported for one timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmEntry {
    /// Errors keyed by alarm name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Value>,
    /// Warnings keyed by alarm name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<Value>,
    /// Informational messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub i: Vec<String>,
}

/// Optional updates a function asks the executor to apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDirectives {
    /// New cursor; only applied when it moves forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_ts: Option<i64>,
    /// Enter or leave catch-up mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_catching_up: Option<bool>,
    /// Self-reported health.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthGrade>,
    /// Replacement carry-over state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Alarms by timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_payload: Option<BTreeMap<i64, AlarmEntry>>,
}

/// Result of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppFuncOutput {
    /// New readings per derived feed name.
    pub derived_readings: BTreeMap<String, Vec<Reading>>,
    /// Updates to apply to the application.
    pub directives: UpdateDirectives,
}

impl AppFuncOutput {
    /// Output that only carries directives.
    pub fn with_directives(directives: UpdateDirectives) -> Self {
        Self {
            derived_readings: BTreeMap::new(),
            directives,
        }
    }

    /// Check the output against the context it was produced for.
    pub fn validate(&self, ctx: &AppContext) -> Result<(), AppFuncError> {
        for (name, readings) in &self.derived_readings {
            if !ctx.derived.contains_key(name) {
                return Err(AppFuncError::InvalidOutput(format!(
                    "readings for unknown derived feed {name:?}"
                )));
            }
            let mut times = BTreeSet::new();
            for reading in readings {
                if !reading.value.is_finite() {
                    return Err(AppFuncError::InvalidOutput(format!(
                        "non-finite value at {} in feed {name:?}",
                        reading.time
                    )));
                }
                if !times.insert(reading.time) {
                    return Err(AppFuncError::InvalidOutput(format!(
                        "repeated time {} in feed {name:?}",
                        reading.time
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A pluggable application function.
///
/// Functions are synchronous and run on the blocking pool. They never touch
/// the store; everything they need is in the [`AppContext`].
pub trait AppFunction: Send + Sync {
    /// Run one invocation.
    fn call(&self, ctx: &AppContext) -> Result<AppFuncOutput, AppFuncError>;
}

impl<F> AppFunction for F
where
    F: Fn(&AppContext) -> Result<AppFuncOutput, AppFuncError> + Send + Sync,
{
    fn call(&self, ctx: &AppContext) -> Result<AppFuncOutput, AppFuncError> {
        self(ctx)
    }
}
