//! # Configuration Modules
//!
//! This module aggregates the configuration providers for the telemetry
//! engine. Settings are read from layered JSON files and merged over
//! built-in defaults.

/// Engine, store and upstream-link settings with layered file loading.
pub mod config_sys;

pub use config_sys::{ConfigError, EngineConfig, StoreConfig, UpstreamConfig};
