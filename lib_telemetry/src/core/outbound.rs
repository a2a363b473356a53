//! # Outbound Queue
//!
//! The bounded FIFO between a consumer's scheduler and the drain loop.
//! Pushing never blocks: when the queue is full the oldest pending batch is
//! evicted so the consumer always gets the most recent state. Evictions are
//! counted so slow consumers can be spotted in the status surface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::ReadingBatch;

/// Bounded drop-oldest queue of batches for one consumer.
#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<ReadingBatch>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    /// A queue holding at most `capacity` batches (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ReadingBatch>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `batch`. Returns `false` when an older batch had to be evicted.
    pub fn push(&self, batch: ReadingBatch) -> bool {
        let mut items = self.lock();
        let mut kept_all = true;
        while items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            kept_all = false;
        }
        items.push_back(batch);
        kept_all
    }

    /// Takes the oldest pending batch, if any.
    pub fn pop(&self) -> Option<ReadingBatch> {
        self.lock().pop_front()
    }

    /// Takes every pending batch in FIFO order.
    pub fn drain(&self) -> Vec<ReadingBatch> {
        self.lock().drain(..).collect()
    }

    /// Pending batch count.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum pending batches.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
