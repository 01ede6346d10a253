// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monapps Engine - rollup worker process
//!
//! Runs the periodic sweeps:
//! - Datastream no-data health
//! - Device health
//! - Asset status / current state / health rollup
//! - Application invocation

use std::sync::Arc;
use tracing::{debug, info, warn};

use monapps_core::Store;
use monapps_core::persistence::postgres::PostgresStore;
use monapps_core::persistence::sqlite::SqliteStore;
use monapps_engine::config::Config;
use monapps_engine::publisher::BroadcastPublisher;
use monapps_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monapps_engine=info,alarm_log=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        instance_id = %config.instance_id,
        debounce_ms = config.debounce.due_time(0),
        "Starting Monapps Engine"
    );

    let store: Arc<dyn Store> = if config.database_url.starts_with("sqlite:") {
        Arc::new(SqliteStore::connect(&config.database_url).await?)
    } else {
        Arc::new(PostgresStore::connect(&config.database_url, config.max_connections).await?)
    };

    info!("Connected to database, schema verified");

    // Without a broker the published changes are only traced.
    let publisher = Arc::new(BroadcastPublisher::default());
    let mut changes = publisher.subscribe();
    tokio::spawn(async move {
        while let Ok(message) = changes.recv().await {
            debug!(topic = %message.topic, payload = %message.payload, "Change published");
        }
    });

    let runtime = EngineRuntime::builder()
        .store(store)
        .publisher(publisher)
        .config(&config)
        .build()?
        .start()
        .await?;

    info!("Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Monapps Engine shut down");

    Ok(())
}
