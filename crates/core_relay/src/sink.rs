use async_trait::async_trait;
use core_types::RelayEvent;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Error, Eq, PartialEq)]
#[error("event sink is closed")]
pub struct SinkClosed;

/// The UI side of the relay. Once `deliver` reports [`SinkClosed`] the relay
/// stops forwarding for that request.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: RelayEvent) -> Result<(), SinkClosed>;
}

/// Forwards events into a bounded channel. Dropping the receiver closes the
/// sink.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RelayEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: RelayEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use core_types::{StreamUpdate, UniversalChunk};

    use super::*;

    fn update(text: &str) -> RelayEvent {
        RelayEvent::Update(StreamUpdate {
            correlation_id: 1,
            chunk: UniversalChunk::delta(text),
        })
    }

    #[tokio::test]
    async fn closes_when_receiver_is_dropped() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.deliver(update("a")).await.expect("open sink");
        assert_eq!(rx.recv().await, Some(update("a")));

        drop(rx);
        assert_eq!(sink.deliver(update("b")).await, Err(SinkClosed));
    }
}
