//! # Upstream Link Supervision
//!
//! The push-ingestion path. A remote source pushes readings over some link;
//! the supervisor keeps that link alive and writes each reading to the store.
//! It runs independently of the per-consumer polling, so either side may be
//! degraded while the other keeps working.
//!
//! After each failure the supervisor waits
//! `min(base * 2^failures, cap)` before reconnecting. A successful connect
//! resets the failure count; a session that later ends counts as a new
//! failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configs::UpstreamConfig;
use crate::connections::ReadingsStore;
use crate::core::{DistributionEngine, EngineError, LinkState};

/// Ways the upstream link can fail.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The connection could not be established.
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The remote side closed the session.
    #[error("upstream closed the session")]
    Closed,

    /// Nothing arrived within the silent timeout.
    #[error("upstream silent for {0:?}")]
    Silent(Duration),

    /// The transport failed mid-session.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// A reading received from upstream, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedReading {
    /// The measured value.
    pub value: i64,
    /// Origin carried by the payload, if any.
    pub origin: Option<String>,
}

/// One connected session with the remote source.
#[async_trait]
pub trait UpstreamSession: Send {
    /// Waits for the next reading. `Ok(None)` means the remote closed cleanly.
    async fn next_reading(&mut self) -> Result<Option<PushedReading>, LinkError>;
}

/// A remote readings source that can be (re)connected.
#[async_trait]
pub trait UpstreamLink: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    /// Opens a new session.
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, LinkError>;
}

/// Wait before the next attempt after `failures` consecutive failures:
/// `min(base * 2^failures, cap)`.
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    1u32.checked_shl(failures)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |wait| wait.min(cap))
}

/// Keeps one [`UpstreamLink`] connected and feeds the store.
pub struct LinkSupervisor {
    link: Arc<dyn UpstreamLink>,
    store: Arc<dyn ReadingsStore>,
    state: Arc<LinkState>,
    config: UpstreamConfig,
    shutdown: CancellationToken,
}

impl LinkSupervisor {
    /// Binds a supervisor to its link, store and shared state.
    pub fn new(
        link: Arc<dyn UpstreamLink>,
        store: Arc<dyn ReadingsStore>,
        state: Arc<LinkState>,
        config: UpstreamConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            link,
            store,
            state,
            config,
            shutdown,
        }
    }

    /// Connect, pump, back off, repeat until shutdown.
    pub async fn run(self) {
        let name = self.link.name().to_string();
        info!(link = %name, "Upstream supervisor started");

        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.link.connect() => result,
            };

            match connected {
                Ok(session) => {
                    self.state.set_reachable(true);
                    self.state.reset_failures();
                    info!(link = %name, "Upstream link connected");

                    let outcome = self.pump(session).await;
                    self.state.set_reachable(false);
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    if let Err(e) = outcome {
                        warn!(link = %name, error = %e, "Upstream session ended");
                    }
                }
                Err(e) => warn!(link = %name, error = %e, "Upstream connect failed"),
            }

            let failures = self.state.record_failure();
            let wait = backoff_delay(
                failures,
                self.config.base_backoff(),
                self.config.max_backoff(),
            );
            info!(link = %name, failures, wait_secs = wait.as_secs(), "Upstream reconnect scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        self.state.set_reachable(false);
        info!(link = %name, "Upstream supervisor stopped");
    }

    async fn pump(&self, mut session: Box<dyn UpstreamSession>) -> Result<(), LinkError> {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = session.next_reading() => next,
            };
            let reading = match next? {
                Some(reading) => reading,
                None => return Err(LinkError::Closed),
            };

            let origin = reading
                .origin
                .as_deref()
                .unwrap_or(&self.config.origin_label);
            match self.store.insert_from(reading.value, origin).await {
                Ok(receipt) => debug!(id = receipt.id, value = reading.value, origin, "Upstream reading stored"),
                // The link stays up; polling reports the store outage.
                Err(e) => warn!(value = reading.value, error = %e, "Upstream reading not stored"),
            }
        }
    }
}

impl DistributionEngine {
    /// Starts supervising `link`. The supervisor stops with the engine and its
    /// health shows up in [`DistributionEngine::status`]. An engine runs at
    /// most one supervisor; a second call is refused.
    pub fn start_upstream(&self, link: Arc<dyn UpstreamLink>) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let state = self.link_state();
        if !state.mark_configured() {
            warn!(link = link.name(), "Upstream link already started, ignoring");
            return Err(EngineError::UpstreamAlreadyStarted);
        }
        let supervisor = LinkSupervisor::new(
            link,
            self.store(),
            state,
            self.config().upstream.clone(),
            self.shutdown_token(),
        );
        self.spawn_tracked(supervisor.run());
        Ok(())
    }
}
