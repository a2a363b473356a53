//! # Connections Module
//!
//! The readings store seam and its backends. Everything above this module
//! talks to a [`ReadingsStore`] trait object and never to a concrete driver.
//!
//! - **`db_postgres`**: pooled PostgreSQL store (`deadpool-postgres`).
//! - **`memory_store`**: process-local store for tests and database-less runs.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Module for PostgreSQL connection pooling and the SQL-backed store.
pub mod db_postgres;

/// Module for the in-memory store.
pub mod memory_store;

pub use db_postgres::PostgresStore;
pub use memory_store::MemoryStore;

/// Origin label used by [`ReadingsStore::insert`].
pub const DEFAULT_ORIGIN: &str = "local";

/// Upper bound of records returned for [`TimeWindow::All`].
pub const ALL_WINDOW_CAP: usize = 1000;

/// A single stored sensor reading. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Store-assigned record identifier.
    pub id: i64,
    /// The measured value.
    pub value: i64,
    /// When the reading was committed.
    pub timestamp: DateTime<Utc>,
    /// Where the reading came from.
    pub origin: String,
}

/// What `insert` hands back once the record is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReceipt {
    /// Record identifier of the new reading.
    pub id: i64,
    /// Commit timestamp of the new reading.
    pub timestamp: DateTime<Utc>,
}

/// Named history windows accepted by [`ReadingsStore::fetch_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// The last hour.
    LastHour,
    /// The last six hours.
    Last6Hours,
    /// The last day.
    Last24Hours,
    /// The last week.
    Last7Days,
    /// The last thirty days.
    Last30Days,
    /// Everything, capped at [`ALL_WINDOW_CAP`] most recent records.
    All,
}

impl TimeWindow {
    /// Length of the window, `None` for [`TimeWindow::All`].
    pub fn duration(&self) -> Option<ChronoDuration> {
        match self {
            TimeWindow::LastHour => Some(ChronoDuration::hours(1)),
            TimeWindow::Last6Hours => Some(ChronoDuration::hours(6)),
            TimeWindow::Last24Hours => Some(ChronoDuration::hours(24)),
            TimeWindow::Last7Days => Some(ChronoDuration::days(7)),
            TimeWindow::Last30Days => Some(ChronoDuration::days(30)),
            TimeWindow::All => None,
        }
    }

    /// Oldest timestamp inside the window, measured from `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now - d)
    }

    /// The short wire name (`1h`, `6h`, `24h`, `7d`, `30d`, `all`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::LastHour => "1h",
            TimeWindow::Last6Hours => "6h",
            TimeWindow::Last24Hours => "24h",
            TimeWindow::Last7Days => "7d",
            TimeWindow::Last30Days => "30d",
            TimeWindow::All => "all",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1h" => Ok(TimeWindow::LastHour),
            "6h" => Ok(TimeWindow::Last6Hours),
            "24h" => Ok(TimeWindow::Last24Hours),
            "7d" => Ok(TimeWindow::Last7Days),
            "30d" => Ok(TimeWindow::Last30Days),
            "all" => Ok(TimeWindow::All),
            other => Err(StoreError::InvalidWindow(other.to_string())),
        }
    }
}

/// Failures surfaced by a [`ReadingsStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached. Transient; callers decide whether to retry.
    #[error("Readings store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the statement failed.
    #[error("Store query failed: {0}")]
    Query(String),

    /// `fetch_latest` needs a positive limit.
    #[error("Invalid fetch limit: {0}")]
    InvalidLimit(usize),

    /// Unknown history window name.
    #[error("Unknown time window: {0:?}")]
    InvalidWindow(String),

    /// The backend could not be built from its configuration.
    #[error("Store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// True for failures that a reconnect could fix.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// The persistent readings source shared by every worker.
///
/// Implementations serialize or pool access internally; callers may use a
/// single `Arc<dyn ReadingsStore>` from any number of tasks. No operation
/// retries on its own except `health_check`, which makes exactly one
/// reconnect attempt before answering `false`.
#[async_trait]
pub trait ReadingsStore: Send + Sync {
    /// Up to `limit` readings, newest first. Fewer when history is short.
    async fn fetch_latest(&self, limit: usize) -> Result<Vec<Reading>, StoreError>;

    /// Commits a reading tagged with `origin`. Visible to every caller once
    /// this returns.
    async fn insert_from(&self, value: i64, origin: &str) -> Result<InsertReceipt, StoreError>;

    /// Commits a locally produced reading.
    async fn insert(&self, value: i64) -> Result<InsertReceipt, StoreError> {
        self.insert_from(value, DEFAULT_ORIGIN).await
    }

    /// Readings inside `window`, oldest first.
    async fn fetch_range(&self, window: TimeWindow) -> Result<Vec<Reading>, StoreError>;

    /// Whether the store is usable right now.
    async fn health_check(&self) -> bool;

    /// Releases the underlying connections. Later calls fail with
    /// [`StoreError::Unavailable`].
    async fn close(&self) {}
}
