//! # Data Ingestors Module
//!
//! The supplementary push path into the readings store. A remote source
//! pushes readings over a long-lived link; a supervisor keeps the link alive
//! with exponential backoff and stores whatever arrives.
//!
//! ## Contained Modules:
//! - **`upstream_link`**: the link/session traits, the backoff rule and the
//!   supervisor, plus `DistributionEngine::start_upstream`.
//! - **`ws_link`**: a WebSocket implementation of the link.

/// Link traits, backoff and supervision.
pub mod upstream_link;
/// WebSocket upstream link.
pub mod ws_link;

// --- Public API Re-exports ---
pub use upstream_link::{
    backoff_delay, LinkError, LinkSupervisor, PushedReading, UpstreamLink, UpstreamSession,
};
pub use ws_link::{parse_payload, WsUpstreamLink};
