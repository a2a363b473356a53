//! # Push Sinks
//!
//! The seam between the engine and whatever transport carries batches to
//! consumers. The engine only knows [`PushSink`]; [`ChannelSink`] is the
//! in-process implementation that turns each consumer into a
//! [`BatchStream`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::ReadingBatch;

/// Why a sink refused a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer's transport is gone; the subscription should end.
    #[error("consumer {0} is disconnected")]
    Disconnected(String),

    /// The consumer is not keeping up; this batch was not delivered.
    #[error("consumer {0} is lagging, batch skipped")]
    Lagging(String),
}

/// Receives batches from the drain loop.
#[async_trait]
pub trait PushSink: Send + Sync {
    /// Delivers one batch for `consumer_id`.
    async fn on_batch(&self, consumer_id: &str, batch: ReadingBatch) -> Result<(), SinkError>;

    /// Whether the transport for `consumer_id` is still open. Checked by the
    /// consumer's worker on every tick.
    fn is_connected(&self, consumer_id: &str) -> bool;

    /// Whether `consumer_id` can take another batch right now. While it
    /// cannot, the drain loop leaves batches in the consumer's outbound queue,
    /// which keeps only the newest ones.
    fn has_room(&self, _consumer_id: &str) -> bool {
        true
    }
}

/// Per-consumer bounded channels feeding [`BatchStream`]s.
#[derive(Debug)]
pub struct ChannelSink {
    senders: Mutex<HashMap<String, mpsc::Sender<ReadingBatch>>>,
    buffer: usize,
}

impl ChannelSink {
    /// A sink whose per-consumer channels hold `buffer` batches.
    pub fn new(buffer: usize) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<ReadingBatch>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a fresh channel for `consumer_id`. Any earlier stream for the same
    /// id ends.
    pub fn attach(&self, consumer_id: &str) -> BatchStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.lock().insert(consumer_id.to_string(), tx).is_some() {
            debug!(consumer_id, "Replaced existing batch channel");
        }
        BatchStream {
            consumer_id: consumer_id.to_string(),
            rx,
        }
    }

    /// Drops the channel for `consumer_id`, ending its stream.
    pub fn detach(&self, consumer_id: &str) {
        self.lock().remove(consumer_id);
    }

    /// Drops every channel, ending all streams.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no channel is open.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl PushSink for ChannelSink {
    async fn on_batch(&self, consumer_id: &str, batch: ReadingBatch) -> Result<(), SinkError> {
        let sender = match self.lock().get(consumer_id) {
            Some(tx) => tx.clone(),
            None => return Err(SinkError::Disconnected(consumer_id.to_string())),
        };
        match sender.try_send(batch) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SinkError::Lagging(consumer_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Only drop the entry if it is still the closed one.
                let mut senders = self.lock();
                if senders.get(consumer_id).is_some_and(|tx| tx.is_closed()) {
                    senders.remove(consumer_id);
                }
                Err(SinkError::Disconnected(consumer_id.to_string()))
            }
        }
    }

    fn is_connected(&self, consumer_id: &str) -> bool {
        self.lock()
            .get(consumer_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn has_room(&self, consumer_id: &str) -> bool {
        // Unknown or closed consumers report room so `on_batch` can say why.
        self.lock()
            .get(consumer_id)
            .is_none_or(|tx| tx.is_closed() || tx.capacity() > 0)
    }
}

/// The stream of batches for one consumer. Dropping it closes the consumer's
/// channel, which the engine treats as a disconnect.
#[derive(Debug)]
pub struct BatchStream {
    consumer_id: String,
    rx: mpsc::Receiver<ReadingBatch>,
}

impl BatchStream {
    /// The consumer this stream belongs to.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Waits for the next batch. `None` once the subscription has ended.
    pub async fn next_batch(&mut self) -> Option<ReadingBatch> {
        self.rx.recv().await
    }

    /// Takes a batch that is already waiting, without blocking.
    pub fn try_next_batch(&mut self) -> Option<ReadingBatch> {
        self.rx.try_recv().ok()
    }

    /// True once the sink side is gone: the subscription was replaced,
    /// ended or shut down. Batches already buffered can still be taken.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

impl Stream for BatchStream {
    type Item = ReadingBatch;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_attached_consumer_receives_batches() {
        let sink = ChannelSink::new(4);
        let mut stream = sink.attach("c1");
        assert!(sink.is_connected("c1"));

        sink.on_batch("c1", ReadingBatch::error()).await.unwrap();
        let batch = stream.next().await.unwrap();
        assert!(!batch.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_consumer_is_disconnected() {
        let sink = ChannelSink::new(4);
        assert!(!sink.is_connected("ghost"));
        assert_eq!(
            sink.on_batch("ghost", ReadingBatch::error()).await,
            Err(SinkError::Disconnected("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_reports_disconnect() {
        let sink = ChannelSink::new(4);
        let stream = sink.attach("c1");
        drop(stream);

        assert!(!sink.is_connected("c1"));
        assert!(matches!(
            sink.on_batch("c1", ReadingBatch::error()).await,
            Err(SinkError::Disconnected(_))
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_full_channel_reports_lagging() {
        let sink = ChannelSink::new(1);
        let mut stream = sink.attach("c1");
        sink.on_batch("c1", ReadingBatch::error()).await.unwrap();
        assert!(matches!(
            sink.on_batch("c1", ReadingBatch::error()).await,
            Err(SinkError::Lagging(_))
        ));
        assert!(stream.try_next_batch().is_some());
        assert!(stream.try_next_batch().is_none());
    }

    #[tokio::test]
    async fn test_room_follows_channel_capacity() {
        let sink = ChannelSink::new(1);
        assert!(sink.has_room("ghost"));

        let mut stream = sink.attach("c1");
        assert!(sink.has_room("c1"));
        sink.on_batch("c1", ReadingBatch::error()).await.unwrap();
        assert!(!sink.has_room("c1"));

        stream.try_next_batch().unwrap();
        assert!(sink.has_room("c1"));
    }

    #[tokio::test]
    async fn test_replaced_stream_is_closed() {
        let sink = ChannelSink::new(2);
        let old = sink.attach("c1");
        let new = sink.attach("c1");
        assert!(old.is_closed());
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_detach_ends_stream() {
        let sink = ChannelSink::new(2);
        let mut stream = sink.attach("c1");
        sink.detach("c1");
        assert!(stream.next_batch().await.is_none());
    }
}
