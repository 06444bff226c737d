//! Gateway configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/power_daq.toml` by default, missing file = defaults)
//! 2. environment variables prefixed with `POWER_DAQ_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use power_daq::config::GatewayConfig;
//!
//! let config = GatewayConfig::load()?;
//! config.validate()?;
//! println!("Listening on port {}", config.device.port);
//! # Ok::<(), power_daq::error::DaqError>(())
//! ```
//!
//! Environment example: `POWER_DAQ_DEVICE__PORT=3000`,
//! `POWER_DAQ_SETTINGS__KWH_RATE=0.21`.

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/power_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "POWER_DAQ_";

/// Log levels accepted in `[application] log_level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Formats accepted in `[application] log_format`.
pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device link settings
    pub device: DeviceConfig,
    /// Persistence settings
    pub storage: StorageConfig,
    /// Numeric settings served through [`ConfigLookup`]
    pub settings: Settings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "power-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Device listener and protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// TCP port the device connects to (0 = ephemeral)
    pub port: u16,
    /// Pre-shared HMAC key
    pub hmac_key: String,
    /// Per-read receive timeout in milliseconds
    pub receive_timeout_ms: u64,
    /// Delay before retrying after an accept error, in milliseconds
    pub accept_retry_ms: u64,
    /// Pause between polls, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: 2048,
            hmac_key: "abc123".to_string(),
            receive_timeout_ms: 2000,
            accept_retry_ms: 500,
            poll_interval_ms: 1000,
        }
    }
}

impl DeviceConfig {
    /// `receive_timeout_ms` as a duration.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// `accept_retry_ms` as a duration.
    pub fn accept_retry(&self) -> Duration {
        Duration::from_millis(self.accept_retry_ms)
    }

    /// `poll_interval_ms` as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the `pd-YYYY-MM-DD.csv` day files
    pub data_dir: PathBuf,
    /// SQLite database with the energy aggregates
    pub database_path: PathBuf,
    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Number of samples kept in memory
    pub ring_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_path: PathBuf::from("power.db"),
            busy_timeout_ms: 1000,
            ring_capacity: crate::data::ring_buffer::DEFAULT_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// `busy_timeout_ms` as a duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Source of numeric runtime settings such as the per-kWh rate.
///
/// Implementations may be backed by a live table; callers ask on every use.
pub trait ConfigLookup: Send + Sync {
    /// Value of `key` clamped to `[min, max]`, or `default` when absent or not finite.
    fn lookup_f64(&self, key: &str, default: f64, min: f64, max: f64) -> f64;
}

/// Flat key/value table from the `[settings]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(pub BTreeMap<String, f64>);

impl Settings {
    /// Insert or replace a setting.
    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }
}

impl ConfigLookup for Settings {
    fn lookup_f64(&self, key: &str, default: f64, min: f64, max: f64) -> f64 {
        match self.0.get(key) {
            Some(value) if value.is_finite() => value.clamp(min, max),
            _ => default,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Missing keys (or a missing file) fall back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        if self.device.hmac_key.is_empty() {
            return Err(DaqError::Configuration("hmac_key must not be empty".into()));
        }

        if self.device.receive_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "receive_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.storage.ring_capacity == 0 {
            return Err(DaqError::Configuration(
                "ring_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}
