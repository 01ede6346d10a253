// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the monapps engine.
//!
//! [`EngineRuntime`] wires a [`Store`], a [`ChangePublisher`] and the
//! application function registry into the four periodic workers and hands
//! out the on-demand entry points (executor, ingestion, lifecycle).
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use monapps_core::persistence::sqlite::SqliteStore;
//! use monapps_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/monapps.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(store)
//!         .instance_id("plant-1")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.ingest().process_message(br#"{"dev-01": {"1000": {"temp": 20.5}}}"#).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use monapps_core::{Clock, Store, SystemClock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app_executor::{AppExecutorConfig, AppFuncExecutor};
use crate::app_function::AppFunctionRegistry;
use crate::app_scheduler::{AppScheduler, AppSchedulerConfig};
use crate::asset_updater::{AssetUpdater, AssetUpdaterConfig};
use crate::config::Config;
use crate::context::JobContext;
use crate::device_updater::{DeviceUpdater, DeviceUpdaterConfig};
use crate::ds_health_updater::{DsHealthUpdater, DsHealthUpdaterConfig};
use crate::ingest::RawDataProcessor;
use crate::lifecycle::Lifecycle;
use crate::publisher::{ChangeNotifier, ChangePublisher, NoopPublisher};
use crate::scheduler::DebounceConfig;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    publisher: Option<Arc<dyn ChangePublisher>>,
    registry: Option<AppFunctionRegistry>,
    clock: Option<Arc<dyn Clock>>,
    instance_id: String,
    debounce: DebounceConfig,
    ds_health: DsHealthUpdaterConfig,
    devices: DeviceUpdaterConfig,
    assets: AssetUpdaterConfig,
    apps: AppSchedulerConfig,
    executor: AppExecutorConfig,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            publisher: None,
            registry: None,
            clock: None,
            instance_id: "monapps".to_string(),
            debounce: DebounceConfig::default(),
            ds_health: DsHealthUpdaterConfig::default(),
            devices: DeviceUpdaterConfig::default(),
            assets: AssetUpdaterConfig::default(),
            apps: AppSchedulerConfig::default(),
            executor: AppExecutorConfig::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the change publisher.
    ///
    /// Default: [`NoopPublisher`]
    pub fn publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Set the application function registry.
    ///
    /// Default: [`AppFunctionRegistry::with_builtins`]
    pub fn registry(mut self, registry: AppFunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the clock.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the instance segment of published topics.
    ///
    /// Default: `monapps`
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the dirty-mark debounce.
    pub fn debounce(mut self, debounce: DebounceConfig) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the datastream health worker configuration.
    pub fn ds_health_config(mut self, config: DsHealthUpdaterConfig) -> Self {
        self.ds_health = config;
        self
    }

    /// Set the device worker configuration.
    pub fn device_config(mut self, config: DeviceUpdaterConfig) -> Self {
        self.devices = config;
        self
    }

    /// Set the asset worker configuration.
    pub fn asset_config(mut self, config: AssetUpdaterConfig) -> Self {
        self.assets = config;
        self
    }

    /// Set the application scheduler configuration.
    pub fn app_scheduler_config(mut self, config: AppSchedulerConfig) -> Self {
        self.apps = config;
        self
    }

    /// Set the per-invocation limits.
    pub fn executor_config(mut self, config: AppExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Apply everything except the database URL from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.instance_id(config.instance_id.clone())
            .debounce(config.debounce)
            .ds_health_config(config.ds_health.clone())
            .device_config(config.devices.clone())
            .asset_config(config.assets.clone())
            .app_scheduler_config(config.apps.clone())
            .executor_config(config.executor.clone())
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.debounce.base_delay_ms < 0 || !(0.0..=1.0).contains(&self.debounce.coef) {
            anyhow::bail!("debounce coefficient must be within 0..=1 and the delay non-negative");
        }

        let publisher = self.publisher.unwrap_or_else(|| Arc::new(NoopPublisher));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = ChangeNotifier::new(publisher, self.instance_id);
        let ctx = JobContext::new(store, notifier, clock, self.debounce);

        Ok(EngineRuntimeConfig {
            ctx,
            registry: Arc::new(self.registry.unwrap_or_else(AppFunctionRegistry::with_builtins)),
            ds_health: self.ds_health,
            devices: self.devices,
            assets: self.assets,
            apps: self.apps,
            executor: self.executor,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    ctx: JobContext,
    registry: Arc<AppFunctionRegistry>,
    ds_health: DsHealthUpdaterConfig,
    devices: DeviceUpdaterConfig,
    assets: AssetUpdaterConfig,
    apps: AppSchedulerConfig,
    executor: AppExecutorConfig,
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the worker tasks.
    pub async fn start(self) -> Result<EngineRuntime> {
        if !self.ctx.store.health_check().await? {
            anyhow::bail!("store health check failed");
        }

        let executor = Arc::new(AppFuncExecutor::new(
            self.ctx.clone(),
            self.registry.clone(),
            self.executor,
        ));

        let ds_health = DsHealthUpdater::new(self.ctx.clone(), self.ds_health);
        let ds_health_shutdown = ds_health.shutdown_handle();
        let ds_health_handle = tokio::spawn(async move {
            ds_health.run().await;
        });

        let devices = DeviceUpdater::new(self.ctx.clone(), self.devices);
        let devices_shutdown = devices.shutdown_handle();
        let devices_handle = tokio::spawn(async move {
            devices.run().await;
        });

        let assets = AssetUpdater::new(self.ctx.clone(), self.assets);
        let assets_shutdown = assets.shutdown_handle();
        let assets_handle = tokio::spawn(async move {
            assets.run().await;
        });

        let apps = AppScheduler::new(self.ctx.clone(), executor.clone(), self.apps);
        let apps_shutdown = apps.shutdown_handle();
        let apps_handle = tokio::spawn(async move {
            apps.run().await;
        });

        info!(
            functions = self.registry.len(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            workers: vec![
                Worker::new("Datastream health updater", ds_health_handle, ds_health_shutdown),
                Worker::new("Device updater", devices_handle, devices_shutdown),
                Worker::new("Asset updater", assets_handle, assets_shutdown),
                Worker::new("Application scheduler", apps_handle, apps_shutdown),
            ],
            ingest: RawDataProcessor::new(self.ctx.clone()),
            lifecycle: Lifecycle::new(self.ctx.clone()),
            executor,
            ctx: self.ctx,
        })
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Worker {
    fn new(name: &'static str, handle: JoinHandle<()>, shutdown: Arc<Notify>) -> Self {
        Self {
            name,
            handle,
            shutdown,
        }
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - Datastream no-data health sweep
/// - Device health sweep
/// - Asset rollup sweep
/// - Application scheduler
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    workers: Vec<Worker>,
    executor: Arc<AppFuncExecutor>,
    ingest: RawDataProcessor,
    lifecycle: Lifecycle,
    ctx: JobContext,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Application executor, for on-demand invocations.
    pub fn executor(&self) -> &Arc<AppFuncExecutor> {
        &self.executor
    }

    /// Raw data ingestion.
    pub fn ingest(&self) -> &RawDataProcessor {
        &self.ingest
    }

    /// Structural changes to the hierarchy.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Change publication.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.ctx.notifier
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every worker to stop, then waits for them to complete. A sweep
    /// in progress finishes its transaction first.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        for worker in &self.workers {
            worker.shutdown.notify_one();
        }

        let mut panicked = 0;
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!("{} task panicked: {}", worker.name, e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            anyhow::bail!("{panicked} worker task(s) panicked");
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|w| !w.handle.is_finished())
    }
}
