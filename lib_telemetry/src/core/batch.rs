//! The dispatch unit handed to consumers on every tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connections::Reading;

/// Every batch carries at least this many values.
pub const MIN_BATCH_LEN: usize = 5;

/// Outcome of the fetch behind a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    /// Values came from the store.
    Ok,
    /// The store could not be read; values are all zero.
    Error,
}

/// One dispatch: a status plus newest-first values, zero padded on the right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingBatch {
    /// Whether the values are real.
    pub status: BatchStatus,
    /// Newest first, never shorter than [`MIN_BATCH_LEN`].
    pub values: Vec<i64>,
    /// When the batch was produced.
    pub dispatched_at: DateTime<Utc>,
}

impl ReadingBatch {
    /// Builds an OK batch from readings as returned by `fetch_latest`.
    pub fn ok(readings: &[Reading]) -> Self {
        let mut values: Vec<i64> = readings.iter().map(|r| r.value).collect();
        if values.len() < MIN_BATCH_LEN {
            values.resize(MIN_BATCH_LEN, 0);
        }
        Self {
            status: BatchStatus::Ok,
            values,
            dispatched_at: Utc::now(),
        }
    }

    /// The batch sent when the store could not be read.
    pub fn error() -> Self {
        Self {
            status: BatchStatus::Error,
            values: vec![0; MIN_BATCH_LEN],
            dispatched_at: Utc::now(),
        }
    }

    /// True for OK batches.
    pub fn is_ok(&self) -> bool {
        self.status == BatchStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings(values: &[i64]) -> Vec<Reading> {
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| Reading {
                id: i as i64,
                value,
                timestamp: Utc::now(),
                origin: "local".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_short_history_is_padded_with_zeros() {
        let batch = ReadingBatch::ok(&readings(&[10, 20, 30]));
        assert_eq!(batch.status, BatchStatus::Ok);
        assert_eq!(batch.values, vec![10, 20, 30, 0, 0]);

        let empty = ReadingBatch::ok(&[]);
        assert_eq!(empty.values, vec![0; MIN_BATCH_LEN]);
    }

    #[test]
    fn test_long_history_is_kept_whole() {
        let values: Vec<i64> = (1..=12).collect();
        let batch = ReadingBatch::ok(&readings(&values));
        assert_eq!(batch.values, values);
    }

    #[test]
    fn test_error_batch_shape() {
        let batch = ReadingBatch::error();
        assert!(!batch.is_ok());
        assert_eq!(batch.values, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_value(ReadingBatch::error()).unwrap();
        assert_eq!(json["status"], "ERROR");
        assert!(json.get("dispatchedAt").is_some());
    }
}
