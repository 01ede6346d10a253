// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker invoking applications whose schedule is due.
//!
//! Due schedules are read without locks; each application is then invoked in
//! its own transaction, which re-checks the schedule under the row lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::app_executor::AppFuncExecutor;
use crate::context::JobContext;
use crate::error::Result;

/// Configuration for the application scheduler.
#[derive(Debug, Clone)]
pub struct AppSchedulerConfig {
    /// How often to look for due applications.
    pub poll_interval: Duration,
    /// Maximum applications invoked per sweep.
    pub batch_size: i64,
}

impl Default for AppSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Periodic application invoker.
pub struct AppScheduler {
    ctx: JobContext,
    executor: Arc<AppFuncExecutor>,
    config: AppSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl AppScheduler {
    /// Create a new scheduler.
    pub fn new(ctx: JobContext, executor: Arc<AppFuncExecutor>, config: AppSchedulerConfig) -> Self {
        Self {
            ctx,
            executor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Application scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Application scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_due().await {
                        error!(error = %e, "Failed to run due applications");
                    }
                }
            }
        }

        info!("Application scheduler stopped");
    }

    /// Invoke every due application once. Returns how many actually ran.
    ///
    /// A failing application is logged and does not stop the sweep.
    pub async fn run_due(&self) -> Result<usize> {
        let now = self.ctx.now();
        let due = {
            let mut tx = self.ctx.store.begin().await?;
            let due = tx.due_app_schedules(now, self.config.batch_size).await?;
            tx.commit().await?;
            due
        };

        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Found due applications");

        let mut invoked = 0;
        for schedule in due {
            match self.executor.invoke_if_due(schedule.app_id).await {
                Ok(Some(_)) => invoked += 1,
                Ok(None) => debug!(app_id = schedule.app_id, "Application no longer due"),
                Err(e) => {
                    error!(app_id = schedule.app_id, error = %e, "Failed to invoke application");
                }
            }
        }

        Ok(invoked)
    }
}
