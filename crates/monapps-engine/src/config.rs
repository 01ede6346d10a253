// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for monapps-engine.
//!
//! Everything is read from `MONAPPS_*` environment variables. Only the
//! database URL is required; the rest default to the production values.

use std::str::FromStr;
use std::time::Duration;

use crate::app_executor::AppExecutorConfig;
use crate::app_scheduler::AppSchedulerConfig;
use crate::asset_updater::AssetUpdaterConfig;
use crate::device_updater::DeviceUpdaterConfig;
use crate::ds_health_updater::DsHealthUpdaterConfig;
use crate::scheduler::DebounceConfig;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://...` or `sqlite:...`
    pub database_url: String,
    /// Pool size for the Postgres backend.
    pub max_connections: u32,
    /// Instance segment of published topics.
    pub instance_id: String,
    /// Dirty-mark debounce.
    pub debounce: DebounceConfig,
    /// Datastream no-data sweep.
    pub ds_health: DsHealthUpdaterConfig,
    /// Device sweep.
    pub devices: DeviceUpdaterConfig,
    /// Asset sweep.
    pub assets: AssetUpdaterConfig,
    /// Application schedule sweep.
    pub apps: AppSchedulerConfig,
    /// Per-invocation limits.
    pub executor: AppExecutorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MONAPPS_DATABASE_URL` | required |
    /// | `MONAPPS_DB_MAX_CONNECTIONS` | 10 |
    /// | `MONAPPS_INSTANCE_ID` | `monapps` |
    /// | `MONAPPS_TIME_ASSET_UPD_MS` | 5000 |
    /// | `MONAPPS_DEBOUNCE_COEF` | 0.2 |
    /// | `MONAPPS_SWEEP_POLL_MS` | 1000 |
    /// | `MONAPPS_MAX_DS_TO_HEALTH_PROC` | 100 |
    /// | `MONAPPS_TIME_DS_HEALTH_EVAL_MS` | 5000 |
    /// | `MONAPPS_NEXT_EVAL_MARGIN_COEF` | 1.5 |
    /// | `MONAPPS_MAX_DEVICES_TO_UPD` | 50 |
    /// | `MONAPPS_MAX_ASSETS_TO_UPD` | 100 |
    /// | `MONAPPS_MAX_APPS_TO_INVOKE` | 100 |
    /// | `MONAPPS_NUM_MAX_DSREADINGS_TO_PROCESS` | 100000 |
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("MONAPPS_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("MONAPPS_DATABASE_URL"))?;

        let max_connections = env_or("MONAPPS_DB_MAX_CONNECTIONS", 10)?;
        let instance_id =
            std::env::var("MONAPPS_INSTANCE_ID").unwrap_or_else(|_| "monapps".to_string());

        let debounce = DebounceConfig {
            base_delay_ms: env_or("MONAPPS_TIME_ASSET_UPD_MS", DebounceConfig::default().base_delay_ms)?,
            coef: env_or("MONAPPS_DEBOUNCE_COEF", DebounceConfig::default().coef)?,
        };
        if !(0.0..=1.0).contains(&debounce.coef) {
            return Err(ConfigError::InvalidValue {
                var: "MONAPPS_DEBOUNCE_COEF",
                value: debounce.coef.to_string(),
            });
        }

        let poll_interval = Duration::from_millis(env_or("MONAPPS_SWEEP_POLL_MS", 1_000)?);

        let ds_defaults = DsHealthUpdaterConfig::default();
        let ds_health = DsHealthUpdaterConfig {
            poll_interval,
            batch_size: env_or("MONAPPS_MAX_DS_TO_HEALTH_PROC", ds_defaults.batch_size)?,
            eval_interval_ms: env_or("MONAPPS_TIME_DS_HEALTH_EVAL_MS", ds_defaults.eval_interval_ms)?,
            eval_margin_coef: env_or("MONAPPS_NEXT_EVAL_MARGIN_COEF", ds_defaults.eval_margin_coef)?,
        };

        let devices = DeviceUpdaterConfig {
            poll_interval,
            batch_size: env_or("MONAPPS_MAX_DEVICES_TO_UPD", DeviceUpdaterConfig::default().batch_size)?,
        };

        let assets = AssetUpdaterConfig {
            poll_interval,
            batch_size: env_or("MONAPPS_MAX_ASSETS_TO_UPD", AssetUpdaterConfig::default().batch_size)?,
        };

        let apps = AppSchedulerConfig {
            poll_interval,
            batch_size: env_or("MONAPPS_MAX_APPS_TO_INVOKE", AppSchedulerConfig::default().batch_size)?,
        };

        let executor = AppExecutorConfig {
            max_native_readings: env_or(
                "MONAPPS_NUM_MAX_DSREADINGS_TO_PROCESS",
                AppExecutorConfig::default().max_native_readings,
            )?,
        };

        Ok(Self {
            database_url,
            max_connections,
            instance_id,
            debounce,
            ds_health,
            devices,
            assets,
            apps,
            executor,
        })
    }
}

fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 8] = [
        "MONAPPS_DATABASE_URL",
        "MONAPPS_INSTANCE_ID",
        "MONAPPS_DEBOUNCE_COEF",
        "MONAPPS_SWEEP_POLL_MS",
        "MONAPPS_MAX_ASSETS_TO_UPD",
        "MONAPPS_MAX_DEVICES_TO_UPD",
        "MONAPPS_NEXT_EVAL_MARGIN_COEF",
        "MONAPPS_TIME_ASSET_UPD_MS",
    ];

    /// Sets env vars for a test and restores them afterwards.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("MONAPPS_DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.instance_id, "monapps");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.debounce.base_delay_ms, 5_000);
        assert!((config.debounce.coef - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.ds_health.batch_size, 100);
        assert_eq!(config.ds_health.eval_interval_ms, 5_000);
        assert!((config.ds_health.eval_margin_coef - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.devices.batch_size, 50);
        assert_eq!(config.assets.batch_size, 100);
        assert_eq!(config.executor.max_native_readings, 100_000);
        assert_eq!(config.assets.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::new();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("MONAPPS_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("MONAPPS_DATABASE_URL", "postgres://localhost/monapps");
        guard.set("MONAPPS_INSTANCE_ID", "plant-7");
        guard.set("MONAPPS_SWEEP_POLL_MS", "250");
        guard.set("MONAPPS_MAX_ASSETS_TO_UPD", "7");
        guard.set("MONAPPS_DEBOUNCE_COEF", "0.5");

        let config = Config::from_env().unwrap();
        assert_eq!(config.instance_id, "plant-7");
        assert_eq!(config.assets.batch_size, 7);
        assert_eq!(config.devices.poll_interval, Duration::from_millis(250));
        assert!((config.debounce.coef - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("MONAPPS_DATABASE_URL", "sqlite::memory:");
        guard.set("MONAPPS_MAX_DEVICES_TO_UPD", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "MONAPPS_MAX_DEVICES_TO_UPD", .. }
        ));
    }

    #[test]
    fn test_config_rejects_debounce_above_one() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("MONAPPS_DATABASE_URL", "sqlite::memory:");
        guard.set("MONAPPS_DEBOUNCE_COEF", "3");

        assert!(Config::from_env().is_err());
    }
}
