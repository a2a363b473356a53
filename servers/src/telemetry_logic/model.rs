use chrono::{DateTime, Utc};
use lib_telemetry::connections::Reading;
use lib_telemetry::core::{BatchStatus, ReadingBatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a WebSocket client may send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    /// New cadence in milliseconds.
    pub interval: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// What the server pushes over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Update {
        status: BatchStatus,
        values: Vec<i64>,
        #[serde(rename = "dispatchedAt")]
        dispatched_at: DateTime<Utc>,
    },
    Notification {
        message: String,
        level: NotificationLevel,
    },
}

impl ServerMessage {
    pub fn notification(level: NotificationLevel, message: impl Into<String>) -> Self {
        ServerMessage::Notification {
            message: message.into(),
            level,
        }
    }
}

impl From<ReadingBatch> for ServerMessage {
    fn from(batch: ReadingBatch) -> Self {
        ServerMessage::Update {
            status: batch.status,
            values: batch.values,
            dispatched_at: batch.dispatched_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub value: Value,
}

impl SendRequest {
    /// Accepts an integer or a string holding one.
    pub fn as_integer(&self) -> Option<i64> {
        match &self.value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResponse {
    pub status: &'static str,
    pub id: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
    pub server: String,
}

impl From<Reading> for HistoryPoint {
    fn from(reading: Reading) -> Self {
        HistoryPoint {
            timestamp: reading.timestamp,
            value: reading.value,
            server: reading.origin,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    #[serde(rename = "timeRange")]
    pub time_range: String,
    pub data: Vec<HistoryPoint>,
}
