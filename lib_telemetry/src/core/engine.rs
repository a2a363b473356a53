//! # Distribution Engine
//!
//! Supervises the per-consumer workers and moves their output to the sink.
//!
//! - **Subscriptions** are serialized through one lifecycle lock: the registry
//!   swaps the entry (cancelling the old token), the old worker is awaited, and
//!   only then is the new worker spawned. Two workers never own the same
//!   consumer id at once.
//! - **Drain loop**: a single task woken by workers through a `Notify`. Each
//!   wake empties every queue in FIFO order. A `Disconnected` answer from the
//!   sink removes that subscription.
//! - **Health monitor**: checks the store on an interval so the status surface
//!   stays current even with no subscribers.
//! - **Shutdown**: stop accepting subscriptions, cancel every token, clear the
//!   registry, wait for all tasks and release the store last.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Cadence, EngineError, PushSink, SinkError, StreamScheduler, SubscriptionRegistry,
    WorkerContext,
};
use crate::configs::EngineConfig;
use crate::connections::ReadingsStore;

/// Health of the supplementary upstream push link.
#[derive(Debug, Default)]
pub struct LinkState {
    configured: AtomicBool,
    reachable: AtomicBool,
    failures: AtomicU32,
}

impl LinkState {
    /// Whether a link supervisor has been started.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Relaxed)
    }

    /// Whether the link is currently connected.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    /// Consecutive failures since the last successful session.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Returns `false` when a supervisor had already claimed the link.
    pub(crate) fn mark_configured(&self) -> bool {
        !self.configured.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.reachable.store(false, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub(crate) fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// Snapshot returned by [`DistributionEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Whether the engine accepts subscriptions.
    pub running: bool,
    /// Last observed store reachability.
    pub store_reachable: bool,
    /// Whether an upstream link supervisor is running.
    pub upstream_link_configured: bool,
    /// Whether the upstream link is connected.
    pub upstream_link_reachable: bool,
    /// Consecutive upstream failures.
    pub upstream_failures: u32,
    /// Live subscriptions.
    pub active_subscription_count: usize,
    /// Batches evicted from full queues across live subscriptions.
    pub dropped_batches: u64,
}

/// Returned by a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// The registered consumer.
    pub consumer_id: String,
    /// Generation of the registry entry.
    pub generation: u64,
    /// Validated cadence.
    pub cadence: Cadence,
}

/// The engine. Share it behind an `Arc`.
pub struct DistributionEngine {
    config: EngineConfig,
    store: Arc<dyn ReadingsStore>,
    sink: Arc<dyn PushSink>,
    registry: Arc<SubscriptionRegistry>,
    ready: Arc<Notify>,
    store_reachable: Arc<AtomicBool>,
    link: Arc<LinkState>,
    shutdown: CancellationToken,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributionEngine {
    /// Builds an engine. Nothing runs until [`DistributionEngine::start`].
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ReadingsStore>,
        sink: Arc<dyn PushSink>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(config.queue_capacity));
        Self {
            config,
            store,
            sink,
            registry,
            ready: Arc::new(Notify::new()),
            store_reachable: Arc::new(AtomicBool::new(false)),
            link: Arc::new(LinkState::default()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the drain loop and the store health monitor. Calling it again
    /// while running is a no-op; a shut-down engine cannot be restarted.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::NotRunning);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drain = tokio::spawn(drain_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
            Arc::clone(&self.ready),
            self.shutdown.clone(),
        ));
        let monitor = tokio::spawn(health_monitor(
            Arc::clone(&self.store),
            Arc::clone(&self.store_reachable),
            self.config.health_check_interval(),
            self.shutdown.clone(),
        ));
        self.track(drain);
        self.track(monitor);

        info!(
            queue_capacity = self.config.queue_capacity,
            min_sleep_ms = self.config.min_sleep_ms,
            "Distribution engine started"
        );
        Ok(())
    }

    /// Whether the engine accepts subscriptions.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Registers `consumer_id` at `cadence_ms` and starts its worker. An
    /// existing subscription for the same id is replaced.
    pub async fn subscribe(
        &self,
        consumer_id: &str,
        cadence_ms: i64,
    ) -> Result<SubscriptionHandle, EngineError> {
        let cadence = Cadence::from_millis(cadence_ms)?;
        self.subscribe_with(consumer_id, cadence).await
    }

    /// [`DistributionEngine::subscribe`] with an already validated cadence.
    pub async fn subscribe_with(
        &self,
        consumer_id: &str,
        cadence: Cadence,
    ) -> Result<SubscriptionHandle, EngineError> {
        self.subscribe_then(consumer_id, cadence, || ())
            .await
            .map(|(handle, ())| handle)
    }

    /// Subscribes and runs `on_registered` inside the same lifecycle critical
    /// section, after the previous worker is gone and before the new one
    /// starts. Transports open their channel here so that channel and
    /// registry entry always belong to the same registration.
    pub(crate) async fn subscribe_then<T>(
        &self,
        consumer_id: &str,
        cadence: Cadence,
        on_registered: impl FnOnce() -> T,
    ) -> Result<(SubscriptionHandle, T), EngineError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let (subscription, previous) =
            self.registry.register(consumer_id, cadence, &self.shutdown)?;
        if let Some(old) = previous {
            join_worker(consumer_id, old.take_worker()).await;
            let discarded = old.queue().drain().len();
            if discarded > 0 {
                debug!(consumer_id, discarded, "Discarded batches of the replaced subscription");
            }
        }

        let attached = on_registered();
        let worker = StreamScheduler::new(self.worker_context(), Arc::clone(&subscription));
        subscription.attach_worker(tokio::spawn(async move {
            worker.run().await;
        }));

        let handle = SubscriptionHandle {
            consumer_id: consumer_id.to_string(),
            generation: subscription.generation(),
            cadence,
        };
        Ok((handle, attached))
    }

    /// Ends the subscription for `consumer_id` and waits for its worker.
    /// Returns `false` when there was nothing to end.
    pub async fn unsubscribe(&self, consumer_id: &str) -> bool {
        self.unsubscribe_then(consumer_id, || ()).await
    }

    /// Unsubscribes and runs `on_removed` before the lifecycle lock is
    /// released, whether or not a subscription existed.
    pub(crate) async fn unsubscribe_then(
        &self,
        consumer_id: &str,
        on_removed: impl FnOnce(),
    ) -> bool {
        let _guard = self.lifecycle.lock().await;
        let existed = match self.registry.unregister(consumer_id) {
            Some(sub) => {
                join_worker(consumer_id, sub.take_worker()).await;
                true
            }
            None => false,
        };
        on_removed();
        existed
    }

    /// Transport callback: the consumer's connection closed.
    pub async fn on_disconnect(&self, consumer_id: &str) {
        if self.unsubscribe(consumer_id).await {
            debug!(consumer_id, "Consumer disconnected");
        }
    }

    /// Ids of live subscriptions. Diagnostics only.
    pub fn list_active(&self) -> std::collections::BTreeSet<String> {
        self.registry.list_active()
    }

    /// Current health and load.
    pub fn status(&self) -> EngineStatus {
        let subscriptions = self.registry.snapshot();
        EngineStatus {
            running: self.is_running(),
            store_reachable: self.store_reachable.load(Ordering::Relaxed),
            upstream_link_configured: self.link.is_configured(),
            upstream_link_reachable: self.link.is_reachable(),
            upstream_failures: self.link.failures(),
            active_subscription_count: subscriptions.len(),
            dropped_batches: subscriptions.iter().map(|s| s.queue().dropped()).sum(),
        }
    }

    /// The shared store.
    pub fn store(&self) -> Arc<dyn ReadingsStore> {
        Arc::clone(&self.store)
    }

    /// The registry, for diagnostics.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stops everything in order. Idempotent.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let subscriptions = self.registry.clear();
        let workers = subscriptions.len();
        for sub in subscriptions {
            join_worker(sub.consumer_id(), sub.take_worker()).await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }

        self.store.close().await;
        self.store_reachable.store(false, Ordering::Relaxed);
        self.link.set_reachable(false);
        info!(workers, "Distribution engine stopped");
    }

    pub(crate) fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            registry: Arc::clone(&self.registry),
            ready: Arc::clone(&self.ready),
            store_reachable: Arc::clone(&self.store_reachable),
            min_sleep: self.config.min_sleep(),
        }
    }

    pub(crate) fn link_state(&self) -> Arc<LinkState> {
        Arc::clone(&self.link)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns a background task that is awaited on shutdown.
    pub(crate) fn spawn_tracked<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(fut));
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

async fn join_worker(consumer_id: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            warn!(consumer_id, "Worker ended abnormally: {}", e);
        }
    }
}

async fn drain_loop(
    registry: Arc<SubscriptionRegistry>,
    sink: Arc<dyn PushSink>,
    ready: Arc<Notify>,
    shutdown: CancellationToken,
) {
    debug!("Drain loop started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ready.notified() => {}
        }

        for sub in registry.snapshot() {
            let consumer_id = sub.consumer_id();
            // A full consumer keeps its batches queued, where drop-oldest applies.
            while sink.has_room(consumer_id) {
                let Some(batch) = sub.queue().pop() else {
                    break;
                };
                match sink.on_batch(consumer_id, batch).await {
                    Ok(()) => {}
                    Err(SinkError::Lagging(_)) => {
                        debug!(consumer_id, "Sink lagging, batch skipped");
                        break;
                    }
                    Err(SinkError::Disconnected(_)) => {
                        registry.unregister_if(consumer_id, sub.generation());
                        sub.queue().drain();
                        break;
                    }
                }
            }
        }
    }
    debug!("Drain loop stopped");
}

async fn health_monitor(
    store: Arc<dyn ReadingsStore>,
    reachable: Arc<AtomicBool>,
    every: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let healthy = tokio::select! {
            _ = shutdown.cancelled() => break,
            healthy = store.health_check() => healthy,
        };
        let was = reachable.swap(healthy, Ordering::Relaxed);
        match (was, healthy) {
            (false, true) => info!("Readings store reachable"),
            (true, false) => warn!("Readings store unreachable"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryStore;
    use crate::core::{BatchStatus, ChannelSink};
    use std::time::Duration;

    fn engine_with(store: Arc<MemoryStore>) -> (Arc<DistributionEngine>, Arc<ChannelSink>) {
        let sink = Arc::new(ChannelSink::new(16));
        let engine = Arc::new(DistributionEngine::new(
            EngineConfig::default(),
            store,
            sink.clone(),
        ));
        engine.start().unwrap();
        (engine, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_before_start_is_rejected() {
        let engine = DistributionEngine::new(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ChannelSink::new(4)),
        );
        assert_eq!(engine.subscribe("c1", 1000).await, Err(EngineError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_cadence_gets_no_worker() {
        let (engine, _sink) = engine_with(Arc::new(MemoryStore::new()));
        assert!(matches!(
            engine.subscribe("c1", 0).await,
            Err(EngineError::InvalidCadence(_))
        ));
        assert!(engine.list_active().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_reach_the_sink() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::from_history(&[10, 20, 30])));
        let mut stream = sink.attach("c1");
        engine.subscribe("c1", 5000).await.unwrap();

        let batch = stream.next_batch().await.unwrap();
        assert_eq!(batch.status, BatchStatus::Ok);
        assert_eq!(batch.values, vec![10, 20, 30, 0, 0]);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_keeps_single_worker() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        let _stream = sink.attach("c1");
        let first = engine.subscribe("c1", 1000).await.unwrap();
        let second = engine.subscribe("c1", 200).await.unwrap();

        assert_ne!(first.generation, second.generation);
        assert_eq!(engine.status().active_subscription_count, 1);
        let live = engine.registry().get("c1").unwrap();
        assert_eq!(live.generation(), second.generation);
        assert_eq!(live.cadence().as_millis(), 200);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_keeps_newest_batches() {
        let store = Arc::new(MemoryStore::from_history(&[0]));
        let sink = Arc::new(ChannelSink::new(2));
        let config = EngineConfig {
            queue_capacity: 2,
            ..EngineConfig::default()
        };
        let engine = DistributionEngine::new(config, store.clone(), sink.clone());
        engine.start().unwrap();
        let mut stream = sink.attach("c1");
        engine.subscribe("c1", 1000).await.unwrap();

        // Ticks at 0..=5s; the channel takes two, the queue keeps the last two.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for value in 1..=5 {
            store.insert(value).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        assert_eq!(engine.status().dropped_batches, 2);

        let mut heads = Vec::new();
        while let Some(batch) = stream.try_next_batch() {
            heads.push(batch.values[0]);
        }
        assert_eq!(heads, vec![0, 1]);

        // The next tick frees the queue into the now empty channel, oldest first.
        store.insert(6).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        while let Some(batch) = stream.try_next_batch() {
            heads.push(batch.values[0]);
        }
        assert_eq!(heads, vec![0, 1, 5, 6]);
        assert_eq!(engine.status().dropped_batches, 3);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_discards_pending_batches() {
        let store = Arc::new(MemoryStore::from_history(&[0]));
        let sink = Arc::new(ChannelSink::new(1));
        let engine = DistributionEngine::new(EngineConfig::default(), store.clone(), sink.clone());
        engine.start().unwrap();
        let _first = sink.attach("c1");
        engine.subscribe("c1", 1000).await.unwrap();

        // The first batch fills the channel, the next two wait in the queue.
        tokio::time::sleep(Duration::from_millis(2010)).await;
        let old = engine.registry().get("c1").unwrap();
        assert_eq!(old.queue().len(), 2);

        store.insert(7).await.unwrap();
        let mut second = sink.attach("c1");
        engine.subscribe("c1", 1000).await.unwrap();
        assert!(old.queue().is_empty());

        let batch = second.next_batch().await.unwrap();
        assert_eq!(batch.values[0], 7);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(second.try_next_batch().is_none());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let (engine, sink) = engine_with(Arc::new(MemoryStore::new()));
        let _stream = sink.attach("c1");
        engine.subscribe("c1", 1000).await.unwrap();

        assert!(!engine.unsubscribe("ghost").await);
        assert_eq!(engine.list_active().len(), 1);
        assert!(engine.unsubscribe("c1").await);
        assert!(!engine.unsubscribe("c1").await);
        assert!(engine.list_active().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_tracks_store() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _sink) = engine_with(store.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.status().store_reachable);

        store.set_available(false);
        tokio::time::sleep(engine.config().health_check_interval()).await;
        assert!(!engine.status().store_reachable);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_and_closes() {
        let store = Arc::new(MemoryStore::from_history(&[1]));
        let (engine, sink) = engine_with(store.clone());
        let mut stream = sink.attach("c1");
        engine.subscribe("c1", 100).await.unwrap();
        stream.next_batch().await.unwrap();

        engine.shutdown().await;
        let status = engine.status();
        assert!(!status.running);
        assert_eq!(status.active_subscription_count, 0);
        assert!(!store.health_check().await);
        assert_eq!(engine.subscribe("c2", 100).await, Err(EngineError::NotRunning));
        assert!(engine.start().is_err());

        // Idempotent.
        engine.shutdown().await;
    }
}
