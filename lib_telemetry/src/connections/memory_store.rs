//! # In-Memory Readings Store
//!
//! A [`ReadingsStore`] kept entirely in process memory. Used when no database
//! URL is configured and by the test suites, which flip its availability to
//! simulate outages.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    InsertReceipt, Reading, ReadingsStore, StoreError, TimeWindow, ALL_WINDOW_CAP, DEFAULT_ORIGIN,
};

/// Process-local store. Readings are kept in insertion order.
#[derive(Debug)]
pub struct MemoryStore {
    readings: Mutex<Vec<Reading>>,
    next_id: AtomicI64,
    available: AtomicBool,
    closed: AtomicBool,
    reconnect_attempts: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty, reachable store.
    pub fn new() -> Self {
        Self {
            readings: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            reconnect_attempts: AtomicUsize::new(0),
        }
    }

    /// A store preloaded with `values`, given newest first the way
    /// `fetch_latest` would return them.
    pub fn from_history(values_newest_first: &[i64]) -> Self {
        let store = Self::new();
        let now = Utc::now();
        {
            let mut readings = store.lock();
            for &value in values_newest_first.iter().rev() {
                let id = store.next_id.fetch_add(1, Ordering::SeqCst);
                readings.push(Reading {
                    id,
                    value,
                    timestamp: now,
                    origin: DEFAULT_ORIGIN.to_string(),
                });
            }
        }
        store
    }

    /// Simulates an outage (`false`) or a recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// How many reconnects `health_check` has attempted so far.
    pub fn reconnect_attempts(&self) -> usize {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of stored readings.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Reading>> {
        self.readings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_reachable(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is closed".to_string()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingsStore for MemoryStore {
    async fn fetch_latest(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        if limit == 0 {
            return Err(StoreError::InvalidLimit(limit));
        }
        self.ensure_reachable()?;
        Ok(self.lock().iter().rev().take(limit).cloned().collect())
    }

    async fn insert_from(&self, value: i64, origin: &str) -> Result<InsertReceipt, StoreError> {
        self.ensure_reachable()?;
        let mut readings = self.lock();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timestamp = Utc::now();
        readings.push(Reading {
            id,
            value,
            timestamp,
            origin: origin.to_string(),
        });
        Ok(InsertReceipt { id, timestamp })
    }

    async fn fetch_range(&self, window: TimeWindow) -> Result<Vec<Reading>, StoreError> {
        self.ensure_reachable()?;
        let readings = self.lock();
        let selected = match window.cutoff(Utc::now()) {
            Some(cutoff) => readings
                .iter()
                .filter(|r| r.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => {
                let skip = readings.len().saturating_sub(ALL_WINDOW_CAP);
                readings.iter().skip(skip).cloned().collect()
            }
        };
        Ok(selected)
    }

    async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if self.available.load(Ordering::SeqCst) {
            return true;
        }
        // One reconnect attempt per failed check.
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
