use std::future::Future;

use crate::Result;
use crate::message::RawMessage;

/// [Kafka] is the bus the streams are read from in production.
///
/// [Kafka]: https://kafka.apache.org/documentation/#design
pub(crate) mod kafka;

/// In-memory bus used by the tests of the pipeline.
#[cfg(test)]
pub(crate) mod test_utils;

pub use kafka::KafkaSourceFactory;

/// Result of a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Polled {
    /// Messages in offset order.
    pub messages: Vec<RawMessage>,
    /// Offset to poll from next: one past the last message, or the requested offset when the poll
    /// came back empty.
    pub next_offset: i64,
}

impl Polled {
    pub fn new(from_offset: i64, messages: Vec<RawMessage>) -> Self {
        let next_offset = messages.last().map_or(from_offset, |last| last.offset + 1);
        Self {
            messages,
            next_offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A restartable reader of one topic. Polling twice from the same offset yields the same
/// messages, the caller owns the position. Polls of one source are never concurrent.
#[trait_variant::make(StreamSource: Send)]
pub trait LocalStreamSource {
    /// Waits for messages at or after `from_offset`, returning once a batch is full or the read
    /// timeout elapsed.
    async fn poll(&self, from_offset: i64) -> Result<Polled>;

    /// Messages between the read position and the head of the topic, if known.
    async fn pending(&self) -> Result<Option<usize>>;
}

/// Creates the source of a chain. Called again when a connection attempt fails.
pub trait SourceFactory: Send + Sync + 'static {
    type Source: StreamSource + Sync + 'static;

    fn connect(&self, topic: &str) -> impl Future<Output = Result<Self::Source>> + Send;
}
