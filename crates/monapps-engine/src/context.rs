// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependencies shared by every job.

use std::sync::Arc;

use monapps_core::{Clock, Store};

use crate::publisher::ChangeNotifier;
use crate::scheduler::DebounceConfig;

/// Store, clock and publication channel handed to each job.
#[derive(Clone)]
pub struct JobContext {
    /// Shared relational store.
    pub store: Arc<dyn Store>,
    /// Publication of committed changes.
    pub notifier: ChangeNotifier,
    /// Source of `now`.
    pub clock: Arc<dyn Clock>,
    /// Debounce for dirty marks.
    pub debounce: DebounceConfig,
}

impl JobContext {
    /// Bundle the shared dependencies.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: ChangeNotifier,
        clock: Arc<dyn Clock>,
        debounce: DebounceConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            debounce,
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("notifier", &self.notifier)
            .field("clock", &self.clock)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}
