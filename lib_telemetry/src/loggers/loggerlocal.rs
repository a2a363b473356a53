//! # Local Logger
//!
//! Installs the process-wide `tracing` subscriber: a console layer, an
//! optional file layer written through a non-blocking appender, and an
//! `EnvFilter` (`RUST_LOG` wins over the configured level).
//!
//! Log files are named `{app}-{YYYYmmdd_HHMMSS}.log`. On every start the
//! directory is pruned so only the newest `keep_files` logs of the app remain.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use glob::{glob, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Logger setup failures.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory could not be prepared.
    #[error("log directory {path}: {source}")]
    Io {
        /// The directory or file involved.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The level directive does not parse.
    #[error("invalid log filter {0:?}")]
    Filter(String),

    /// The rotation glob could not be built.
    #[error("invalid log file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A global subscriber is already installed.
    #[error("logger already initialised: {0}")]
    Init(String),
}

/// # Logger Local Options
///
/// Where and how log lines are written.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerLocalOptions {
    /// Default filter directive, e.g. `info` or `lib_telemetry=debug,info`.
    pub level: String,
    /// Write to stdout.
    pub use_tty: bool,
    /// Write to a file in `log_dir`.
    pub use_file: bool,
    /// Directory for log files. Defaults to `./logs`.
    pub log_dir: Option<PathBuf>,
    /// How many log files of this app to keep, the new one included.
    pub keep_files: usize,
    /// Emit JSON lines instead of plain text.
    pub json: bool,
}

impl Default for LoggerLocalOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            use_tty: true,
            use_file: false,
            log_dir: None,
            keep_files: 5,
            json: false,
        }
    }
}

impl LoggerLocalOptions {
    /// The effective log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs"))
    }
}

/// Timestamped file name for a new log of `app_name`.
pub fn log_file_name(app_name: &str) -> String {
    format!("{}-{}.log", app_name, Local::now().format("%Y%m%d_%H%M%S"))
}

/// Deletes all but the newest `keep` log files of `app_name` in `log_dir`.
/// Returns how many files were removed.
pub fn rotate_logs(app_name: &str, log_dir: &Path, keep: usize) -> Result<usize, LoggerError> {
    let pattern = format!(
        "{}/{}-*.log",
        Pattern::escape(&log_dir.display().to_string()),
        Pattern::escape(app_name)
    );
    let mut log_files: Vec<PathBuf> = glob(&pattern)?.filter_map(Result::ok).collect();

    // The timestamp in the name sorts lexically; newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = %old_file.display(), error = %e, "Could not delete old log file"),
        }
    }
    Ok(removed)
}

/// Installs the global subscriber for `app_name`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init_logging(
    app_name: &str,
    options: &LoggerLocalOptions,
) -> Result<Option<WorkerGuard>, LoggerError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&options.level)
            .map_err(|_| LoggerError::Filter(options.level.clone()))?,
    };

    let tty_layer = options.use_tty.then(|| {
        if options.json {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().with_target(true).boxed()
        }
    });

    let mut guard = None;
    let file_layer = if options.use_file {
        let log_dir = options.log_dir();
        fs::create_dir_all(&log_dir).map_err(|source| LoggerError::Io {
            path: log_dir.clone(),
            source,
        })?;

        let appender = tracing_appender::rolling::never(&log_dir, log_file_name(app_name));
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);

        let layer = if options.json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tty_layer)
        .with(file_layer)
        .with(filter)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    // After install, so failed deletions are logged. The new file counts.
    if options.use_file {
        rotate_logs(app_name, &options.log_dir(), options.keep_files.max(1))?;
    }
    Ok(guard)
}
