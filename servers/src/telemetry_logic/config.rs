use anyhow::{Context, Result};
use clap::Parser;
use lib_telemetry::configs::config_sys::load_layered;
use lib_telemetry::configs::EngineConfig;
use lib_telemetry::core::Cadence;
use lib_telemetry::loggers::LoggerLocalOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const APP_NAME: &str = "server_telemetry";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Real-time telemetry distribution server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TELEMETRY_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "TELEMETRY_CONFIG_DIR", help = "Directory holding the layered JSON configuration files.")]
    pub config_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_MODE", help = "Configuration mode, selects {app}.{mode}.json (e.g. development, production).")]
    pub mode: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL. Without it readings are kept in memory.")]
    pub database_url: Option<String>,

    #[clap(long, env = "TELEMETRY_UPSTREAM_URL", help = "WebSocket URL of an upstream readings source to ingest from.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "TELEMETRY_DEFAULT_INTERVAL_MS", help = "Cadence used when a client does not ask for one.")]
    pub default_interval_ms: Option<i64>,

    #[clap(long, env = "TELEMETRY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TELEMETRY_LOG_LEVEL", help = "Logging filter (trace, debug, info, warn, error or a full directive).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TELEMETRY_LOG_TO_FILE", help = "Also write logs to a rotated file (true/false).")]
    pub log_to_file: Option<bool>,

    #[clap(long, env = "TELEMETRY_LOG_JSON", help = "Emit logs as JSON lines (true/false).")]
    pub log_json: Option<bool>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_dir: other.config_dir.or(self.config_dir),
            mode: other.mode.or(self.mode),
            database_url: other.database_url.or(self.database_url),
            upstream_url: other.upstream_url.or(self.upstream_url),
            default_interval_ms: other.default_interval_ms.or(self.default_interval_ms),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_to_file: other.log_to_file.or(self.log_to_file),
            log_json: other.log_json.or(self.log_json),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8000),
            config_dir: Some(PathBuf::from("./config")),
            default_interval_ms: Some(5000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_to_file: Some(false),
            log_json: Some(false),
            ..Default::default()
        }
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub default_cadence: Cadence,
    pub logger: LoggerLocalOptions,
    pub engine: EngineConfig,
}

/// Defaults, then layered JSON files for the engine, then env vars and CLI.
pub fn load_settings() -> Result<Settings> {
    resolve(Config::parse())
}

pub fn resolve(cli: Config) -> Result<Settings> {
    let config = Config::defaults().merge(cli);

    let config_dir = config.config_dir.clone().unwrap_or_else(|| PathBuf::from("./config"));
    let mut engine = load_layered(&config_dir, APP_NAME, config.mode.as_deref())
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;

    if config.database_url.is_some() {
        engine.store.database_url = config.database_url.clone();
    }
    if config.upstream_url.is_some() {
        engine.upstream.url = config.upstream_url.clone();
    }
    engine.validate()?;

    let default_cadence = Cadence::from_millis(config.default_interval_ms.unwrap_or(5000))
        .context("TELEMETRY_DEFAULT_INTERVAL_MS must be a positive number of milliseconds")?;

    let logger = LoggerLocalOptions {
        level: config.log_level.unwrap_or_else(|| "info".to_string()),
        use_tty: true,
        use_file: config.log_to_file.unwrap_or(false),
        log_dir: config.log_dir,
        json: config.log_json.unwrap_or(false),
        ..LoggerLocalOptions::default()
    };

    Ok(Settings {
        port: config.port.unwrap_or(8000),
        default_cadence,
        logger,
        engine,
    })
}
