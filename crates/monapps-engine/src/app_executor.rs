// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-application execution pipeline.
//!
//! One invocation runs in one transaction:
//!
//! ```text
//! lock application + schedule
//!   │
//!   ├─ enabled? ── SAVEPOINT app_exec
//!   │                lock datafeeds, load native windows after the cursor
//!   │                call the function on the blocking pool
//!   │                insert derived readings, assign status / current state
//!   │                catch-up toggle, cursor, alarms, state
//!   │              failure ─▶ ROLLBACK TO app_exec, exception health = ERROR
//!   │
//!   └─ post-exec (always): staleness, health, schedule, parent mark, COMMIT
//! ```
//!
//! The savepoint confines a failed function or a duplicate derived reading
//! to the execute step, while the health it causes still commits.

use std::collections::BTreeSet;
use std::sync::Arc;

use monapps_core::StoreTx;
use monapps_core::model::{
    AppSchedule, Application, CURR_STATE_FEED, Datafeed, Field, HealthGrade, Reading,
    ReadingKind, ReadingRange, STATUS_FEED, Tracked,
};
use tracing::{debug, error, info};

use crate::alarm_log::{self, AlarmLevel};
use crate::app_function::{
    AppContext, AppFuncError, AppFunctionRegistry, NativeFeed, UpdateDirectives,
};
use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::health;
use crate::scheduler;

const SAVEPOINT: &str = "app_exec";

/// Limits of one invocation.
#[derive(Debug, Clone)]
pub struct AppExecutorConfig {
    /// Maximum native readings loaded per feed.
    pub max_native_readings: i64,
}

impl Default for AppExecutorConfig {
    fn default() -> Self {
        Self {
            max_native_readings: 100_000,
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationReport {
    /// Application id.
    pub app_id: i64,
    /// The function was called (the application was enabled).
    pub executed: bool,
    /// The execute step failed and was rolled back.
    pub failed: bool,
    /// Derived readings written.
    pub readings_written: u64,
    /// Application fields changed by the invocation.
    pub changed: BTreeSet<Field>,
    /// Health after the invocation.
    pub health: HealthGrade,
    /// Next scheduled run.
    pub next_run_ts: i64,
}

/// What a successful execute step produced.
struct ExecOutcome {
    reported_health: Option<HealthGrade>,
    feeds: Vec<(Datafeed, BTreeSet<Field>)>,
    written: u64,
}

/// Runs application functions.
pub struct AppFuncExecutor {
    ctx: JobContext,
    registry: Arc<AppFunctionRegistry>,
    config: AppExecutorConfig,
}

impl AppFuncExecutor {
    /// Create an executor.
    pub fn new(
        ctx: JobContext,
        registry: Arc<AppFunctionRegistry>,
        config: AppExecutorConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            config,
        }
    }

    /// Invoke an application now, regardless of its schedule.
    pub async fn invoke(&self, app_id: i64) -> Result<InvocationReport> {
        self.run(app_id, false)
            .await?
            .ok_or(Error::NotFound {
                entity: "app_schedule",
                id: app_id,
            })
    }

    /// Invoke an application if its schedule is enabled and due. Another job
    /// may have run it since the schedule was read, so this is re-checked
    /// under the lock.
    pub async fn invoke_if_due(&self, app_id: i64) -> Result<Option<InvocationReport>> {
        self.run(app_id, true).await
    }

    async fn run(&self, app_id: i64, only_if_due: bool) -> Result<Option<InvocationReport>> {
        let mut now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;

        let Some(app) = tx.lock_application(app_id).await? else {
            tx.rollback().await?;
            return Err(Error::NotFound {
                entity: "application",
                id: app_id,
            });
        };
        let Some(mut schedule) = tx.lock_app_schedule(app_id).await? else {
            tx.rollback().await?;
            return Err(Error::NotFound {
                entity: "app_schedule",
                id: app_id,
            });
        };
        if only_if_due && (!schedule.is_enabled || schedule.next_run_ts > now) {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut app = Tracked::new(app);
        let mut excep_health = HealthGrade::Undefined;
        let mut reported_health = HealthGrade::Undefined;
        let mut feeds = Vec::new();
        let mut written = 0;
        let executed = app.is_enabled;

        if executed {
            let app_snapshot = (*app).clone();
            let schedule_snapshot = schedule.clone();

            tx.savepoint(SAVEPOINT).await?;
            debug!(app_id, "Starting application function");
            match self.execute(&mut *tx, &mut app, &mut schedule, now).await {
                Ok(outcome) => {
                    tx.release_savepoint(SAVEPOINT).await?;
                    reported_health = health::reported_health(outcome.reported_health);
                    feeds = outcome.feeds;
                    written = outcome.written;
                    debug!(app_id, readings = written, "Application function executed");
                }
                Err(e) => {
                    tx.rollback_to_savepoint(SAVEPOINT).await?;
                    tx.release_savepoint(SAVEPOINT).await?;
                    app.reset(app_snapshot);
                    schedule = schedule_snapshot;
                    excep_health = HealthGrade::Error;

                    let msg = if e.is_duplicate_reading() {
                        "Attempt to rewrite existing derived readings".to_string()
                    } else {
                        format!("Application function failed: {e}")
                    };
                    error!(app_id, error = %e, "{msg}");
                    alarm_log::record(AlarmLevel::Error, &*app, now, &msg);
                }
            }
        }

        // The function may have run for a while.
        now = self.ctx.now();
        post_exec(&mut app, now, excep_health, reported_health);

        schedule.next_run_ts = now + schedule.interval_ms;
        tx.save_app_schedule(&schedule).await?;

        if app.has_changes() {
            tx.save_application(&app).await?;
        }
        let rollup = scheduler::rollup_fields(app.dirty());
        scheduler::mark_parent(&mut *tx, app.parent_id, rollup, now, &self.ctx.debounce).await?;

        tx.commit().await?;

        let (app, changed) = app.into_parts();
        self.ctx.notifier.notify_updated(&app, &changed);
        for (feed, fields) in &feeds {
            self.ctx.notifier.notify_updated(feed, fields);
        }

        if excep_health == HealthGrade::Error || !changed.is_empty() {
            info!(
                app_id,
                health = %app.health,
                cursor_ts = app.cursor_ts,
                failed = excep_health == HealthGrade::Error,
                "Application invoked"
            );
        }

        Ok(Some(InvocationReport {
            app_id,
            executed,
            failed: excep_health == HealthGrade::Error,
            readings_written: written,
            changed,
            health: app.health,
            next_run_ts: schedule.next_run_ts,
        }))
    }

    async fn execute(
        &self,
        tx: &mut dyn StoreTx,
        app: &mut Tracked<Application>,
        schedule: &mut AppSchedule,
        now: i64,
    ) -> Result<ExecOutcome> {
        let function = self.registry.get(&app.func_name, &app.func_version)?;
        let datafeeds = tx.lock_datafeeds(app.id).await?;

        // A cursor behind all native data would make the function walk empty
        // history first.
        let mut earliest: Option<i64> = None;
        for feed in &datafeeds {
            if let Some(ds_id) = feed.datastream_id {
                let first = tx
                    .list_ds_readings(ds_id, ReadingKind::Valid, &ReadingRange::default().with_limit(1))
                    .await?;
                if let Some(first) = first.first() {
                    earliest = Some(earliest.map_or(first.time, |e| e.min(first.time)));
                }
            }
        }
        // The window starts after the cursor, so park it just before the
        // earliest reading.
        if let Some(earliest) = earliest
            && app.set_if_greater(Field::CursorTs, |a| &mut a.cursor_ts, earliest - 1)
        {
            debug!(app_id = app.id, cursor_ts = app.cursor_ts, "Cursor snapped to earliest reading");
        }

        let max = self.config.max_native_readings;
        let window = ReadingRange::after(app.cursor_ts).with_limit(max + 1);
        let mut native = std::collections::BTreeMap::new();
        let mut derived = std::collections::BTreeMap::new();
        for feed in datafeeds {
            match feed.datastream_id {
                Some(ds_id) => {
                    let mut readings = tx.list_ds_readings(ds_id, ReadingKind::Valid, &window).await?;
                    let truncated = readings.len() as i64 > max;
                    readings.truncate(max.max(0) as usize);
                    native.insert(
                        feed.name.clone(),
                        NativeFeed {
                            feed,
                            readings,
                            truncated,
                        },
                    );
                }
                None => {
                    derived.insert(feed.name.clone(), feed);
                }
            }
        }

        let ctx = AppContext {
            app: (**app).clone(),
            native,
            derived,
            now_ms: now,
        };
        let joined = tokio::task::spawn_blocking(move || {
            let output = function.call(&ctx);
            (ctx, output)
        })
        .await;
        let (ctx, output) = match joined {
            Ok(pair) => pair,
            Err(e) if e.is_panic() => {
                return Err(AppFuncError::Panicked(panic_message(e.into_panic())).into());
            }
            Err(e) => return Err(e.into()),
        };
        let output = output?;
        output.validate(&ctx)?;

        let AppContext { mut derived, .. } = ctx;
        let mut feeds = Vec::new();
        let mut written = 0;
        let catching_up = app.is_catching_up;

        for (name, mut readings) in output.derived_readings {
            let Some(feed) = derived.remove(&name) else {
                continue;
            };
            if readings.is_empty() {
                continue;
            }
            if feed.is_value_integer {
                for reading in &mut readings {
                    reading.value = reading.value.round();
                }
            }

            written += tx.insert_df_readings(feed.id, &readings).await?;

            let Some(latest) = readings.iter().max_by_key(|r| r.time).copied() else {
                continue;
            };
            let mut feed = Tracked::new(feed);
            if feed.set_if_newer(Field::LastReadingTs, |f| &mut f.last_reading_ts, latest.time) {
                tx.save_datafeed(&feed).await?;
            }

            if !catching_up {
                if name == STATUS_FEED && app.has_status() {
                    assign_signal(app, Signal::Status, latest);
                } else if name == CURR_STATE_FEED && app.has_curr_state() {
                    assign_signal(app, Signal::CurrState, latest);
                }
            }

            let (feed, fields) = feed.into_parts();
            if !fields.is_empty() {
                feeds.push((feed, fields));
            }
        }

        let UpdateDirectives {
            cursor_ts,
            is_catching_up,
            health,
            state,
            alarm_payload,
        } = output.directives;

        if let Some(flag) = is_catching_up
            && app.set(Field::IsCatchingUp, |a| &mut a.is_catching_up, flag)
        {
            schedule.interval_ms = app.active_interval_ms();
            info!(
                app_id = app.id,
                is_catching_up = flag,
                interval_ms = schedule.interval_ms,
                "Catch-up mode changed"
            );
        }

        if let Some(ts) = cursor_ts {
            app.set_if_greater(Field::CursorTs, |a| &mut a.cursor_ts, ts);
        }

        if let Some(payload) = alarm_payload {
            for (ts, entry) in &payload {
                let errors = alarm_log::merge_alarms(&app.errors, entry.e.as_ref(), *ts);
                app.set(Field::Errors, |a| &mut a.errors, errors);
                let warnings = alarm_log::merge_alarms(&app.warnings, entry.w.as_ref(), *ts);
                app.set(Field::Warnings, |a| &mut a.warnings, warnings);
                for msg in &entry.i {
                    alarm_log::record(AlarmLevel::Info, &**app, *ts, msg);
                }
            }
        }

        if let Some(state) = state {
            app.set(Field::State, |a| &mut a.state, state);
        }

        Ok(ExecOutcome {
            reported_health: health,
            feeds,
            written,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Status,
    CurrState,
}

/// Take the newest status / current-state reading. The update time moves
/// whenever the reading is newer; the value and the alarm log entry only
/// when the value differs.
fn assign_signal(app: &mut Tracked<Application>, signal: Signal, latest: Reading) {
    let value = latest.value.round() as i32;
    let (accepted, changed, label) = match signal {
        Signal::Status => {
            let accepted = app.set_if_newer(
                Field::LastStatusUpdateTs,
                |a| &mut a.last_status_update_ts,
                latest.time,
            );
            let changed = accepted && app.set(Field::Status, |a| &mut a.status, Some(value));
            (accepted, changed, "Status")
        }
        Signal::CurrState => {
            let accepted = app.set_if_newer(
                Field::LastCurrStateUpdateTs,
                |a| &mut a.last_curr_state_update_ts,
                latest.time,
            );
            let changed =
                accepted && app.set(Field::CurrState, |a| &mut a.curr_state, Some(value));
            (accepted, changed, "Current state")
        }
    };
    if accepted && changed {
        alarm_log::record(
            AlarmLevel::Info,
            &**app,
            latest.time,
            &format!("{label} changed"),
        );
    }
}

/// Bookkeeping that runs after every invocation, executed or not.
///
/// Staleness is left alone while catching up. Health is the worst of the
/// cursor lag, the function's own report and the exception flag.
pub(crate) fn post_exec(
    app: &mut Tracked<Application>,
    now: i64,
    excep_health: HealthGrade,
    reported_health: HealthGrade,
) {
    if !app.is_catching_up {
        if app.has_status() {
            let stale = health::is_stale(
                app.last_status_update_ts,
                app.created_ts,
                now,
                app.time_status_stale,
            );
            if app.set(Field::IsStatusStale, |a| &mut a.is_status_stale, stale) && stale {
                alarm_log::record(AlarmLevel::Info, &**app, now, "Status is stale");
            }
        }
        if app.has_curr_state() {
            let stale = health::is_stale(
                app.last_curr_state_update_ts,
                app.created_ts,
                now,
                app.time_curr_state_stale,
            );
            if app.set(Field::IsCurrStateStale, |a| &mut a.is_curr_state_stale, stale) && stale {
                alarm_log::record(AlarmLevel::Info, &**app, now, "Current state is stale");
            }
        }
    }

    let health = HealthGrade::worst([
        health::cursor_health(app, now),
        reported_health,
        excep_health,
    ]);
    if app.set(Field::Health, |a| &mut a.health, health) {
        alarm_log::record(AlarmLevel::Info, &**app, now, "Health changed");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app() -> Application {
        Application {
            id: 1,
            type_id: 1,
            type_name: "t".into(),
            func_name: "f".into(),
            df_schema: json!({
                "Status": {"datatype": "int", "derived": true},
                "Current state": {"datatype": "int", "derived": true}
            }),
            func_version: "0.0.1".into(),
            time_resample: 60_000,
            settings: json!({}),
            state: json!({}),
            errors: json!({}),
            warnings: json!({}),
            cursor_ts: 1_000,
            is_enabled: true,
            is_catching_up: false,
            invoc_interval_ms: 60_000,
            catch_up_interval_ms: 5_000,
            status: None,
            curr_state: None,
            last_status_update_ts: None,
            last_curr_state_update_ts: None,
            time_status_stale: 10_000,
            time_curr_state_stale: 10_000,
            is_status_stale: false,
            is_curr_state_stale: false,
            health: HealthGrade::Undefined,
            time_health_error: 5_000,
            parent_id: Some(9),
            created_ts: 0,
        }
    }

    #[test]
    fn test_post_exec_health_is_worst_of_sources() {
        let grades = [
            HealthGrade::Undefined,
            HealthGrade::Ok,
            HealthGrade::Warning,
            HealthGrade::Error,
        ];
        for excep in grades {
            for reported in grades {
                let mut tracked = Tracked::new(app());
                post_exec(&mut tracked, 2_000, excep, reported);
                let expected = HealthGrade::worst([HealthGrade::Ok, excep, reported]);
                assert_eq!(tracked.health, expected, "{excep} / {reported}");
            }
        }
    }

    #[test]
    fn test_post_exec_cursor_lag_is_error() {
        let mut tracked = Tracked::new(app());
        post_exec(&mut tracked, 7_000, HealthGrade::Undefined, HealthGrade::Undefined);
        assert_eq!(tracked.health, HealthGrade::Error);
    }

    #[test]
    fn test_post_exec_staleness_from_creation() {
        let mut tracked = Tracked::new(app());
        post_exec(&mut tracked, 10_001, HealthGrade::Undefined, HealthGrade::Undefined);
        assert!(tracked.is_status_stale);
        assert!(tracked.is_curr_state_stale);
        assert!(tracked.is_dirty(Field::IsStatusStale));
    }

    #[test]
    fn test_post_exec_skips_staleness_while_catching_up() {
        let mut tracked = Tracked::new(Application {
            is_catching_up: true,
            ..app()
        });
        post_exec(&mut tracked, 100_000, HealthGrade::Undefined, HealthGrade::Undefined);
        assert!(!tracked.is_status_stale);
        assert_eq!(tracked.health, HealthGrade::Undefined);
    }

    #[test]
    fn test_assign_signal_needs_newer_time() {
        let mut tracked = Tracked::new(app());
        assign_signal(&mut tracked, Signal::Status, Reading::new(5_000, 2.0));
        assert_eq!(tracked.status, Some(2));
        assert_eq!(tracked.last_status_update_ts, Some(5_000));

        assign_signal(&mut tracked, Signal::Status, Reading::new(4_000, 3.0));
        assert_eq!(tracked.status, Some(2));

        assign_signal(&mut tracked, Signal::Status, Reading::new(6_000, 2.0));
        assert_eq!(tracked.status, Some(2));
        assert_eq!(tracked.last_status_update_ts, Some(6_000));

        assign_signal(&mut tracked, Signal::CurrState, Reading::new(6_000, 1.4));
        assert_eq!(tracked.curr_state, Some(1));
    }

    #[test]
    fn test_panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(7)), "unknown panic");
    }
}
