//! # Stream Scheduler
//!
//! One worker per live [`Subscription`]. A worker loops on its own ticker:
//!
//! 1. stop if the subscription was cancelled or the consumer's transport is
//!    closed (the registry entry is removed in the latter case);
//! 2. fetch `cadence.fetch_limit()` rows and turn them into a batch, or into an
//!    ERROR batch when the store fails;
//! 3. push the batch onto the consumer's queue and wake the drain loop;
//! 4. sleep `max(min_sleep, cadence - elapsed)`.
//!
//! The first tick fires immediately. After a failed tick the next one starts
//! with a store health check, which makes the single reconnect attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{PushSink, ReadingBatch, Subscription, SubscriptionRegistry};
use crate::connections::ReadingsStore;

/// Everything a worker needs besides its own subscription.
#[derive(Clone)]
pub struct WorkerContext {
    /// Source of readings.
    pub store: Arc<dyn ReadingsStore>,
    /// Transport, consulted for liveness only.
    pub sink: Arc<dyn PushSink>,
    /// Registry, for removing entries whose transport is gone.
    pub registry: Arc<SubscriptionRegistry>,
    /// Wakes the drain loop.
    pub ready: Arc<Notify>,
    /// Last observed store reachability, shared with the status surface.
    pub store_reachable: Arc<AtomicBool>,
    /// Floor of the sleep between ticks.
    pub min_sleep: Duration,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The subscription token was cancelled (unsubscribe, replacement or
    /// engine shutdown).
    Cancelled,
    /// The sink reported the consumer's transport as closed.
    TransportClosed,
}

/// The polling worker for one subscription.
pub struct StreamScheduler {
    ctx: WorkerContext,
    subscription: Arc<Subscription>,
    store_suspect: bool,
}

impl StreamScheduler {
    /// Binds a worker to `subscription`.
    pub fn new(ctx: WorkerContext, subscription: Arc<Subscription>) -> Self {
        Self {
            ctx,
            subscription,
            store_suspect: false,
        }
    }

    /// Runs until the subscription ends. The subscription reference is
    /// released when this returns.
    pub async fn run(mut self) -> StopReason {
        let sub = Arc::clone(&self.subscription);
        let consumer_id = sub.consumer_id();
        let cadence = sub.cadence();
        let token = sub.token().clone();
        debug!(consumer_id, cadence_ms = cadence.as_millis(), "Worker started");

        let reason = loop {
            if token.is_cancelled() {
                break StopReason::Cancelled;
            }
            if !self.ctx.sink.is_connected(consumer_id) {
                self.ctx
                    .registry
                    .unregister_if(consumer_id, sub.generation());
                break StopReason::TransportClosed;
            }

            let started = Instant::now();
            let batch = tokio::select! {
                biased;
                _ = token.cancelled() => break StopReason::Cancelled,
                batch = self.produce() => batch,
            };
            if token.is_cancelled() {
                break StopReason::Cancelled;
            }

            if !sub.queue().push(batch) {
                debug!(consumer_id, dropped = sub.queue().dropped(), "Outbound queue full, oldest batch dropped");
            }
            sub.record_dispatch(Utc::now());
            self.ctx.ready.notify_one();

            let delay = cadence.next_delay(started.elapsed(), self.ctx.min_sleep);
            tokio::select! {
                biased;
                _ = token.cancelled() => break StopReason::Cancelled,
                _ = sleep(delay) => {}
            }
        };

        debug!(consumer_id, ?reason, dispatched = sub.dispatched(), "Worker stopped");
        reason
    }

    /// One fetch, converted to a batch. Never fails.
    async fn produce(&mut self) -> ReadingBatch {
        let consumer_id = self.subscription.consumer_id();

        if self.store_suspect {
            if !self.ctx.store.health_check().await {
                self.ctx.store_reachable.store(false, Ordering::Relaxed);
                return ReadingBatch::error();
            }
            info!(consumer_id, "Store reachable again");
            self.store_suspect = false;
        }

        let limit = self.subscription.cadence().fetch_limit();
        match self.ctx.store.fetch_latest(limit).await {
            Ok(readings) => {
                self.ctx.store_reachable.store(true, Ordering::Relaxed);
                ReadingBatch::ok(&readings)
            }
            Err(e) => {
                if e.is_unavailable() {
                    self.store_suspect = true;
                    self.ctx.store_reachable.store(false, Ordering::Relaxed);
                }
                warn!(consumer_id, error = %e, "Fetch failed, sending ERROR batch");
                ReadingBatch::error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryStore;
    use crate::core::{BatchStatus, Cadence, ChannelSink};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        store: Arc<MemoryStore>,
        sink: Arc<ChannelSink>,
        registry: Arc<SubscriptionRegistry>,
        ctx: WorkerContext,
        root: CancellationToken,
    }

    fn harness(store: MemoryStore) -> Harness {
        let store = Arc::new(store);
        let sink = Arc::new(ChannelSink::new(8));
        let registry = Arc::new(SubscriptionRegistry::new(8));
        let ctx = WorkerContext {
            store: store.clone(),
            sink: sink.clone(),
            registry: registry.clone(),
            ready: Arc::new(Notify::new()),
            store_reachable: Arc::new(AtomicBool::new(true)),
            min_sleep: Duration::from_millis(100),
        };
        Harness {
            store,
            sink,
            registry,
            ctx,
            root: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_immediate_and_padded() {
        let h = harness(MemoryStore::from_history(&[10, 20, 30]));
        let _stream = h.sink.attach("c1");
        let (sub, _) = h
            .registry
            .register("c1", Cadence::from_millis(5_000).unwrap(), &h.root)
            .unwrap();
        let worker = tokio::spawn(StreamScheduler::new(h.ctx.clone(), sub.clone()).run());

        tokio::time::sleep(Duration::from_millis(1)).await;
        let batch = sub.queue().pop().unwrap();
        assert_eq!(batch.status, BatchStatus::Ok);
        assert_eq!(batch.values, vec![10, 20, 30, 0, 0]);

        h.registry.unregister("c1");
        assert_eq!(worker.await.unwrap(), StopReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_yields_error_batches_then_recovers() {
        let h = harness(MemoryStore::from_history(&[7]));
        h.store.set_available(false);
        let _stream = h.sink.attach("c2");
        let (sub, _) = h
            .registry
            .register("c2", Cadence::from_millis(1_000).unwrap(), &h.root)
            .unwrap();
        let worker = tokio::spawn(StreamScheduler::new(h.ctx.clone(), sub.clone()).run());

        // Ticks at 0, 1s, 2s.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let batches = sub.queue().drain();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.status == BatchStatus::Error && b.values == vec![0; 5]));
        assert!(h.store.reconnect_attempts() >= 2);
        assert!(!h.ctx.store_reachable.load(Ordering::Relaxed));

        h.store.set_available(true);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let recovered = sub.queue().pop().unwrap();
        assert_eq!(recovered.values, vec![7, 0, 0, 0, 0]);
        assert!(h.ctx.store_reachable.load(Ordering::Relaxed));

        h.root.cancel();
        assert_eq!(worker.await.unwrap(), StopReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_transport_stops_worker_and_unregisters() {
        let h = harness(MemoryStore::new());
        let stream = h.sink.attach("c1");
        let (sub, _) = h
            .registry
            .register("c1", Cadence::from_millis(500).unwrap(), &h.root)
            .unwrap();
        let worker = tokio::spawn(StreamScheduler::new(h.ctx.clone(), sub.clone()).run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(stream);

        let reason = tokio::time::timeout(Duration::from_millis(600), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::TransportClosed);
        assert!(h.registry.get("c1").is_none());
    }
}
