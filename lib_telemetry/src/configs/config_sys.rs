//! # Engine Configuration
//!
//! Runtime settings for the distribution engine. Values come from three
//! optional JSON files in a configuration directory, applied in order:
//!
//! 1. `config.global.json`
//! 2. `{app}.common.json`
//! 3. `{app}.{mode}.json`
//! 4. `{app}.{mode}.{os}.json`
//!
//! Later files override earlier ones key by key, and anything still missing
//! falls back to [`EngineConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{ext::*, *};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_GLOBAL_NAME: &str = "config.global.json";
const LAYER_COUNT: usize = 4;

/// Errors raised while reading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered files could not be read or parsed.
    #[error("Failed to build configuration: {0}")]
    Build(String),

    /// The merged document does not describe a usable configuration.
    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Connection settings for the readings store.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// PostgreSQL URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Upper bound of pooled connections.
    pub max_connections: usize,
    /// Budget for acquiring, creating or recycling a pooled connection.
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 8,
            connect_timeout_ms: 3_000,
        }
    }
}

impl StoreConfig {
    /// The connection-level timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Settings for the supplementary upstream push link.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    /// WebSocket URL of the remote readings source. `None` disables the link.
    pub url: Option<String>,
    /// Origin label stored with readings that carry none of their own.
    pub origin_label: String,
    /// Base of the exponential backoff, in seconds.
    pub base_backoff_secs: u64,
    /// Ceiling of the exponential backoff, in seconds.
    pub max_backoff_secs: u64,
    /// Silence longer than this is treated as a dead link.
    pub silent_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            origin_label: "upstream".to_string(),
            base_backoff_secs: 5,
            max_backoff_secs: 300,
            silent_timeout_secs: 30,
        }
    }
}

impl UpstreamConfig {
    /// Backoff base as a `Duration`.
    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs(self.base_backoff_secs)
    }

    /// Backoff ceiling as a `Duration`.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Silent-link watchdog as a `Duration`.
    pub fn silent_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_timeout_secs)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Capacity of each consumer's outbound queue. When full, the oldest
    /// pending batch is dropped.
    pub queue_capacity: usize,
    /// Floor for a worker's sleep between ticks, in milliseconds.
    pub min_sleep_ms: u64,
    /// Per-consumer channel depth between the drain loop and the transport.
    pub stream_buffer: usize,
    /// How often the engine checks the store for the status surface.
    pub health_check_interval_ms: u64,
    /// Readings store settings.
    pub store: StoreConfig,
    /// Upstream push link settings.
    pub upstream: UpstreamConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            min_sleep_ms: 100,
            stream_buffer: 16,
            health_check_interval_ms: 5_000,
            store: StoreConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Minimum sleep between worker ticks.
    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    /// Interval of the store health monitor.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queueCapacity must be at least 1".into()));
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::Invalid("streamBuffer must be at least 1".into()));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::Invalid("healthCheckIntervalMs must be positive".into()));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Invalid("store.maxConnections must be at least 1".into()));
        }
        if self.upstream.base_backoff_secs == 0 {
            return Err(ConfigError::Invalid("upstream.baseBackoffSecs must be positive".into()));
        }
        if self.upstream.max_backoff_secs < self.upstream.base_backoff_secs {
            return Err(ConfigError::Invalid(format!(
                "upstream.maxBackoffSecs ({}) is below upstream.baseBackoffSecs ({})",
                self.upstream.max_backoff_secs, self.upstream.base_backoff_secs
            )));
        }
        Ok(())
    }

    /// Parses a single JSON document over the defaults.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Lists the layered files for `app_name` in `config_dir`, in merge order:
/// global, common, mode and mode-per-platform. Without a mode only the first
/// two apply.
pub fn layered_files(config_dir: &Path, app_name: &str, mode: Option<&str>) -> Vec<PathBuf> {
    let mut files = vec![
        config_dir.join(CONFIG_GLOBAL_NAME),
        config_dir.join(format!("{}.common.json", app_name)),
    ];
    if let Some(mode) = mode {
        files.push(config_dir.join(format!("{}.{}.json", app_name, mode)));
        files.push(config_dir.join(format!(
            "{}.{}.{}.json",
            app_name,
            mode,
            std::env::consts::OS
        )));
    }
    files
}

/// Loads the engine configuration from the layered files in `config_dir`.
///
/// Missing files are skipped; a malformed file is an error. The result is
/// validated before it is returned.
pub fn load_layered(
    config_dir: &Path,
    app_name: &str,
    mode: Option<&str>,
) -> Result<EngineConfig, ConfigError> {
    let mut layers: Vec<String> = layered_files(config_dir, app_name, mode)
        .iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    // Unused layers stay empty and optional.
    layers.resize(LAYER_COUNT, String::new());

    let config_data: Box<dyn ConfigurationRoot> = DefaultConfigurationBuilder::new()
        .add_json_file(&layers[0].is().optional())
        .add_json_file(&layers[1].is().optional())
        .add_json_file(&layers[2].is().optional())
        .add_json_file(&layers[3].is().optional())
        .build()
        .map_err(|e| ConfigError::Build(format!("{:?}", e)))?;

    let config: EngineConfig = config_data.reify();
    config.validate()?;
    Ok(config)
}
