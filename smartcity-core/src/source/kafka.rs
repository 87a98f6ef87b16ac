use std::time::Duration;

use smartcity_kafka::{KafkaMessage, KafkaSource, KafkaSourceConfig};

use crate::config::KafkaSettings;
use crate::message::RawMessage;
use crate::source::{Polled, SourceFactory, StreamSource};

impl From<KafkaMessage> for RawMessage {
    fn from(message: KafkaMessage) -> Self {
        RawMessage {
            topic: message.topic,
            offset: message.offset,
            payload: message.value,
        }
    }
}

/// Connects every chain to its topic-partition on the configured cluster.
#[derive(Debug, Clone)]
pub struct KafkaSourceFactory {
    settings: KafkaSettings,
    batch_size: usize,
    read_timeout: Duration,
}

impl KafkaSourceFactory {
    pub fn new(settings: KafkaSettings, batch_size: usize, read_timeout: Duration) -> Self {
        Self {
            settings,
            batch_size,
            read_timeout,
        }
    }

    fn source_config(&self, topic: &str) -> KafkaSourceConfig {
        KafkaSourceConfig {
            brokers: self.settings.brokers.clone(),
            topic: topic.to_string(),
            partition: self.settings.partition,
            consumer_group: self.settings.consumer_group.clone(),
            auth: self.settings.auth.clone(),
            tls: self.settings.tls.clone(),
            kafka_raw_config: self.settings.raw_config.clone(),
        }
    }
}

impl SourceFactory for KafkaSourceFactory {
    type Source = KafkaStreamSource;

    async fn connect(&self, topic: &str) -> crate::Result<KafkaStreamSource> {
        let source =
            KafkaSource::connect(self.source_config(topic), self.batch_size, self.read_timeout)
                .await?;
        Ok(KafkaStreamSource { source })
    }
}

pub struct KafkaStreamSource {
    source: KafkaSource,
}

impl StreamSource for KafkaStreamSource {
    async fn poll(&self, from_offset: i64) -> crate::Result<Polled> {
        let messages = self
            .source
            .read_from(from_offset)
            .await?
            .into_iter()
            .map(RawMessage::from)
            .collect();
        Ok(Polled::new(from_offset, messages))
    }

    async fn pending(&self) -> crate::Result<Option<usize>> {
        Ok(self.source.pending_messages().await?)
    }
}
