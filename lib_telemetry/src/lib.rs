//! # lib_telemetry
//!
//! Building blocks for the telemetry distribution service. Each folder is a
//! feature-gated module so that small tools can pull in only what they need.
//!
//! - **`configs`**: layered JSON configuration for the engine.
//! - **`connections`**: the `ReadingsStore` abstraction with PostgreSQL and
//!   in-memory backends.
//! - **`core`**: subscription registry, per-consumer stream schedulers, the
//!   distribution engine and the broadcast gateway.
//! - **`ingestors`**: the supplementary upstream push link and its backoff
//!   supervisor.
//! - **`loggers`**: `tracing` subscriber setup with rotated log files.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
