//! # Subscription Registry
//!
//! The in-memory table of live consumers. Each consumer id maps to exactly one
//! [`Subscription`]; registering an id that is already present replaces the
//! old entry and cancels its token before the new entry becomes visible.
//!
//! Mutations take the write half of a single registry-wide lock, so they are
//! mutually exclusive. Listing takes the read half and may run alongside other
//! readers. Nothing here drives scheduling: each worker owns its own ticker.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Cadence, EngineError, OutboundQueue};

/// Longest accepted consumer id, in bytes.
pub const MAX_CONSUMER_ID_LEN: usize = 128;

/// One live consumer: its cadence, its outbound queue and the token that stops
/// its worker.
#[derive(Debug)]
pub struct Subscription {
    consumer_id: String,
    cadence: Cadence,
    generation: u64,
    queue: OutboundQueue,
    token: CancellationToken,
    last_dispatch: Mutex<Option<DateTime<Utc>>>,
    dispatched: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn new(
        consumer_id: String,
        cadence: Cadence,
        generation: u64,
        queue_capacity: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            consumer_id,
            cadence,
            generation,
            queue: OutboundQueue::new(queue_capacity),
            token,
            last_dispatch: Mutex::new(None),
            dispatched: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// The consumer this subscription belongs to.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Requested refresh interval.
    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Distinguishes this entry from earlier ones under the same id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Batches waiting for the drain loop.
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Cancelled when the subscription ends for any reason.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the subscription has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// When the worker last produced a batch.
    pub fn last_dispatch(&self) -> Option<DateTime<Utc>> {
        *self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Batches produced so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dispatch(&self, at: DateTime<Utc>) {
        *self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attach_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Checks a consumer id: non-empty, at most [`MAX_CONSUMER_ID_LEN`] bytes and
/// free of control characters.
pub fn validate_consumer_id(consumer_id: &str) -> Result<(), EngineError> {
    if consumer_id.trim().is_empty() {
        return Err(EngineError::InvalidConsumerId("consumer id is empty".to_string()));
    }
    if consumer_id.len() > MAX_CONSUMER_ID_LEN {
        return Err(EngineError::InvalidConsumerId(format!(
            "consumer id is longer than {} bytes",
            MAX_CONSUMER_ID_LEN
        )));
    }
    if consumer_id.chars().any(char::is_control) {
        return Err(EngineError::InvalidConsumerId(
            "consumer id contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Owner of every [`Subscription`].
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Arc<Subscription>>>,
    next_generation: AtomicU64,
    queue_capacity: usize,
}

impl SubscriptionRegistry {
    /// An empty registry whose subscriptions get queues of `queue_capacity`.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            queue_capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `consumer_id`, replacing any previous entry.
    ///
    /// The new subscription's token is a child of `parent`. The previous entry,
    /// if any, is cancelled before this returns and handed back so the caller
    /// can wait for its worker.
    pub fn register(
        &self,
        consumer_id: &str,
        cadence: Cadence,
        parent: &CancellationToken,
    ) -> Result<(Arc<Subscription>, Option<Arc<Subscription>>), EngineError> {
        validate_consumer_id(consumer_id)?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription::new(
            consumer_id.to_string(),
            cadence,
            generation,
            self.queue_capacity,
            parent.child_token(),
        ));

        let previous = {
            let mut entries = self.write();
            let previous = entries.insert(consumer_id.to_string(), Arc::clone(&subscription));
            if let Some(old) = &previous {
                old.token.cancel();
            }
            previous
        };

        match &previous {
            Some(old) => info!(
                consumer_id,
                %cadence,
                replaced_generation = old.generation,
                pending_discarded = old.queue.len(),
                "Subscription replaced"
            ),
            None => info!(consumer_id, %cadence, "Subscription registered"),
        }
        Ok((subscription, previous))
    }

    /// Removes `consumer_id`. Unknown ids are ignored.
    pub fn unregister(&self, consumer_id: &str) -> Option<Arc<Subscription>> {
        let removed = self.write().remove(consumer_id);
        if let Some(sub) = &removed {
            sub.token.cancel();
            info!(consumer_id, generation = sub.generation, "Subscription removed");
        }
        removed
    }

    /// Removes `consumer_id` only while it still refers to `generation`, so a
    /// stale worker cannot evict the entry that replaced it.
    pub fn unregister_if(&self, consumer_id: &str, generation: u64) -> Option<Arc<Subscription>> {
        let removed = {
            let mut entries = self.write();
            match entries.get(consumer_id) {
                Some(current) if current.generation == generation => entries.remove(consumer_id),
                _ => None,
            }
        };
        if let Some(sub) = &removed {
            sub.token.cancel();
            debug!(consumer_id, generation, "Stale subscription removed");
        }
        removed
    }

    /// The live subscription for `consumer_id`.
    pub fn get(&self, consumer_id: &str) -> Option<Arc<Subscription>> {
        self.read().get(consumer_id).cloned()
    }

    /// Ids of every live subscription. Diagnostics only.
    pub fn list_active(&self) -> BTreeSet<String> {
        self.read().keys().cloned().collect()
    }

    /// Every live subscription.
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.read().values().cloned().collect()
    }

    /// Cancels and removes everything.
    pub fn clear(&self) -> Vec<Arc<Subscription>> {
        let drained: Vec<Arc<Subscription>> = self.write().drain().map(|(_, sub)| sub).collect();
        for sub in &drained {
            sub.token.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Registry cleared");
        }
        drained
    }

    /// Live subscription count.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when no consumer is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
