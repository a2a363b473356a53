//! # Broadcast Gateway
//!
//! The surface transports talk to. A gateway pairs a [`DistributionEngine`]
//! with a [`ChannelSink`], so subscribing hands back a [`BatchStream`] that a
//! WebSocket handler (or anything else) can forward as it likes. Dropping
//! the stream counts as a disconnect.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::registry::validate_consumer_id;
use super::{
    BatchStream, Cadence, ChannelSink, DistributionEngine, EngineError, EngineStatus,
    ReadingBatch, MIN_BATCH_LEN,
};
use crate::configs::EngineConfig;
use crate::connections::ReadingsStore;

/// Engine plus channel sink, exposed as a subscribe/unsubscribe API.
pub struct BroadcastGateway {
    engine: Arc<DistributionEngine>,
    sink: Arc<ChannelSink>,
}

impl BroadcastGateway {
    /// Builds the sink and the engine. Call [`BroadcastGateway::start`] next.
    pub fn new(config: EngineConfig, store: Arc<dyn ReadingsStore>) -> Self {
        let sink = Arc::new(ChannelSink::new(config.stream_buffer));
        let engine = Arc::new(DistributionEngine::new(config, store, sink.clone()));
        Self { engine, sink }
    }

    /// Starts the underlying engine.
    pub fn start(&self) -> Result<(), EngineError> {
        self.engine.start()
    }

    /// Subscribes `consumer_id` at `cadence_ms` and returns its stream.
    pub async fn subscribe(
        &self,
        consumer_id: &str,
        cadence_ms: i64,
    ) -> Result<BatchStream, EngineError> {
        self.subscribe_with(consumer_id, Cadence::from_millis(cadence_ms)?)
            .await
    }

    /// [`BroadcastGateway::subscribe`] with an already validated cadence.
    pub async fn subscribe_with(
        &self,
        consumer_id: &str,
        cadence: Cadence,
    ) -> Result<BatchStream, EngineError> {
        validate_consumer_id(consumer_id)?;
        let sink = &self.sink;
        let (handle, stream) = self
            .engine
            .subscribe_then(consumer_id, cadence, || sink.attach(consumer_id))
            .await?;
        debug!(consumer_id, generation = handle.generation, "Stream opened");
        Ok(stream)
    }

    /// Ends the subscription and its stream. Unknown ids are ignored.
    pub async fn unsubscribe(&self, consumer_id: &str) -> bool {
        let sink = &self.sink;
        self.engine
            .unsubscribe_then(consumer_id, || sink.detach(consumer_id))
            .await
    }

    /// Transport callback for a closed connection.
    pub async fn on_disconnect(&self, consumer_id: &str) {
        if self.unsubscribe(consumer_id).await {
            debug!(consumer_id, "Consumer disconnected");
        }
    }

    /// One-off latest batch, outside any subscription.
    pub async fn latest_batch(&self) -> ReadingBatch {
        match self.engine.store().fetch_latest(MIN_BATCH_LEN).await {
            Ok(readings) => ReadingBatch::ok(&readings),
            Err(e) => {
                debug!(error = %e, "Latest batch unavailable");
                ReadingBatch::error()
            }
        }
    }

    /// Engine health and load.
    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    /// Ids of live subscriptions.
    pub fn list_active(&self) -> BTreeSet<String> {
        self.engine.list_active()
    }

    /// The shared store.
    pub fn store(&self) -> Arc<dyn ReadingsStore> {
        self.engine.store()
    }

    /// The engine behind this gateway.
    pub fn engine(&self) -> &Arc<DistributionEngine> {
        &self.engine
    }

    /// Shuts the engine down and ends every stream.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.sink.clear();
    }
}
