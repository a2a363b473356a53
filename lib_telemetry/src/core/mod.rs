//! # Core Engine Module
//!
//! The distribution engine and the pieces it is assembled from. Data moves
//! through it in one direction:
//!
//! ```text
//! ReadingsStore -> StreamScheduler (one per consumer) -> OutboundQueue
//!               -> drain loop -> PushSink -> consumer
//! ```
//!
//! ## Core Components:
//!
//! - **`registry`**: owns every [`Subscription`]; one entry per consumer id,
//!   replacement on re-registration.
//! - **`scheduler`**: the per-consumer polling worker.
//! - **`engine`**: spawns workers, drains their queues into the sink, watches
//!   store health and shuts everything down in order.
//! - **`gateway`**: the subscription surface handed to transports; each
//!   subscriber gets a [`BatchStream`].
//! - **`sink`**, **`outbound`**, **`batch`**, **`cadence`**: the types flowing
//!   between them.

use thiserror::Error;

/// The dispatch unit and its padding rules.
pub mod batch;
/// Cadence validation, fetch limits and tick delays.
pub mod cadence;
/// Orchestration of workers, drain loop and shutdown.
pub mod engine;
/// The subscriber-facing bridge over the engine.
pub mod gateway;
/// Bounded drop-oldest queue between a worker and the drain loop.
pub mod outbound;
/// Owner of all live subscriptions.
pub mod registry;
/// The per-consumer polling worker.
pub mod scheduler;
/// The push sink seam and the channel-backed sink.
pub mod sink;

// --- Public API Re-exports ---
pub use batch::{BatchStatus, ReadingBatch, MIN_BATCH_LEN};
pub use cadence::Cadence;
pub use engine::{DistributionEngine, EngineStatus, LinkState, SubscriptionHandle};
pub use gateway::BroadcastGateway;
pub use outbound::OutboundQueue;
pub use registry::{Subscription, SubscriptionRegistry};
pub use scheduler::{StopReason, StreamScheduler, WorkerContext};
pub use sink::{BatchStream, ChannelSink, PushSink, SinkError};

/// Errors returned synchronously by the subscription surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The cadence is not a positive millisecond count.
    #[error("Invalid cadence: {0:?} (expected a positive number of milliseconds)")]
    InvalidCadence(String),

    /// The consumer id cannot be used as a registry key.
    #[error("Invalid consumer id: {0}")]
    InvalidConsumerId(String),

    /// The engine has not been started or is shutting down.
    #[error("Distribution engine is not running")]
    NotRunning,

    /// An upstream link supervisor is already running for this engine.
    #[error("Upstream link already started")]
    UpstreamAlreadyStarted,
}
