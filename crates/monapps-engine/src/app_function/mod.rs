// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pluggable application functions and their registry.

mod fake_data_generator;
mod monitoring;
mod traits;

pub use fake_data_generator::fake_data_generator_0_0_1;
pub use monitoring::monitoring_0_0_1;
pub use traits::*;

use std::collections::HashMap;
use std::sync::Arc;

/// Functions by `(name, version)`.
#[derive(Clone, Default)]
pub struct AppFunctionRegistry {
    functions: HashMap<(String, String), Arc<dyn AppFunction>>,
}

impl AppFunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("monitoring", "0.0.1", monitoring_0_0_1)
            .register("fake_data_generator", "0.0.1", fake_data_generator_0_0_1);
        registry
    }

    /// Register a function, replacing any previous one under the same key.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        function: impl AppFunction + 'static,
    ) -> &mut Self {
        self.functions
            .insert((name.into(), version.into()), Arc::new(function));
        self
    }

    /// Look up a function.
    pub fn get(&self, name: &str, version: &str) -> Result<Arc<dyn AppFunction>, AppFuncError> {
        self.functions
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| AppFuncError::UnknownFunction {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Start of the resample step holding `ts`. A non-positive step leaves `ts`
/// as is.
pub(crate) fn floor_ts(ts: i64, step: i64) -> i64 {
    if step > 0 { ts - ts.rem_euclid(step) } else { ts }
}

impl std::fmt::Debug for AppFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.functions.keys().collect();
        keys.sort();
        f.debug_struct("AppFunctionRegistry")
            .field("functions", &keys)
            .finish()
    }
}
