//! # WebSocket Upstream Link
//!
//! Connects to a remote readings source over WebSocket. Each text (or UTF-8
//! binary) frame carries one reading, either as a bare integer or as
//! `{"value": 42, "origin": "router-7"}`. Frames that parse as neither are
//! logged and skipped. A link that stays silent for longer than the
//! configured timeout is treated as dead.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{LinkError, PushedReading, UpstreamLink, UpstreamSession};
use crate::configs::UpstreamConfig;

/// Upstream link over a WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsUpstreamLink {
    url: String,
    silent_timeout: Duration,
}

impl WsUpstreamLink {
    /// A link to `url` that gives up after `silent_timeout` without frames.
    pub fn new(url: impl Into<String>, silent_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            silent_timeout,
        }
    }

    /// Builds the link from configuration, `None` when no URL is set.
    pub fn from_config(config: &UpstreamConfig) -> Option<Self> {
        config
            .url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.silent_timeout()))
    }

    /// The remote URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamLink for WsUpstreamLink {
    fn name(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, LinkError> {
        info!("Connecting to upstream: {}", self.url);
        let (ws_stream, _) = timeout(self.silent_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| LinkError::Connect(format!("timed out after {:?}", self.silent_timeout)))?
            .map_err(|e| LinkError::Connect(e.to_string()))?;
        Ok(Box::new(WsSession {
            ws_stream,
            silent_timeout: self.silent_timeout,
        }))
    }
}

struct WsSession {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    silent_timeout: Duration,
}

#[async_trait]
impl UpstreamSession for WsSession {
    async fn next_reading(&mut self) -> Result<Option<PushedReading>, LinkError> {
        loop {
            // Any frame, heartbeats included, restarts the watchdog.
            let frame = timeout(self.silent_timeout, self.ws_stream.next())
                .await
                .map_err(|_| LinkError::Silent(self.silent_timeout))?;

            let text = match frame {
                None => return Ok(None),
                Some(Err(e)) => return Err(LinkError::Transport(e.to_string())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(bin))) => match std::str::from_utf8(&bin) {
                    Ok(text) => text.to_owned(),
                    Err(_) => {
                        debug!(len = bin.len(), "Skipping non UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(_)) => continue,
            };

            match parse_payload(&text) {
                Some(reading) => return Ok(Some(reading)),
                None => debug!("Skipping unrecognised upstream frame: {}", text),
            }
        }
    }
}

/// Parses one upstream frame into a reading.
pub fn parse_payload(text: &str) -> Option<PushedReading> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(PushedReading { value, origin: None });
    }

    match serde_json::from_str::<Value>(text).ok()? {
        Value::Number(n) => n.as_i64().map(|value| PushedReading { value, origin: None }),
        Value::Object(map) => {
            let value = match map.get("value")? {
                Value::Number(n) => n.as_i64()?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            let origin = map
                .get("origin")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(PushedReading { value, origin })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_integer() {
        assert_eq!(
            parse_payload(" 42\n"),
            Some(PushedReading { value: 42, origin: None })
        );
        assert_eq!(parse_payload("-7").map(|r| r.value), Some(-7));
    }

    #[test]
    fn test_object_payload() {
        assert_eq!(
            parse_payload(r#"{"value": 15, "origin": "router-7"}"#),
            Some(PushedReading {
                value: 15,
                origin: Some("router-7".to_string())
            })
        );
        assert_eq!(
            parse_payload(r#"{"value": "16", "origin": ""}"#),
            Some(PushedReading { value: 16, origin: None })
        );
    }

    #[test]
    fn test_rejects_other_shapes() {
        assert_eq!(parse_payload("hello"), None);
        assert_eq!(parse_payload("3.5"), None);
        assert_eq!(parse_payload(r#"{"origin": "x"}"#), None);
        assert_eq!(parse_payload(r#"[1, 2]"#), None);
    }

    #[test]
    fn test_link_from_config() {
        let mut config = UpstreamConfig::default();
        assert!(WsUpstreamLink::from_config(&config).is_none());
        config.url = Some("ws://127.0.0.1:9000/readings".to_string());
        let link = WsUpstreamLink::from_config(&config).unwrap();
        assert_eq!(link.url(), "ws://127.0.0.1:9000/readings");
        assert_eq!(link.name(), link.url());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let link = WsUpstreamLink::new("ws://127.0.0.1:1/readings", Duration::from_secs(2));
        assert!(matches!(link.connect().await, Err(LinkError::Connect(_))));
    }
}
