use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{Consumer, ConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

/// Give up on a read after this many consecutive consumer errors.
const MAX_FAILURE_COUNT: usize = 10;
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic to consume.
    pub topic: String,
    /// The partition of the topic to consume.
    pub partition: i32,
    /// Used as `group.id`; offsets are never committed to the group.
    pub consumer_group: String,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

/// A message read from the topic-partition.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// The user payload, empty if the record had none.
    pub value: Bytes,
    pub key: Option<String>,
    /// Milliseconds since epoch, if the broker provided one.
    pub timestamp: Option<i64>,
}

// Routes librdkafka client errors through tracing.
struct KafkaContext;

impl ClientContext for KafkaContext {
    fn error(&self, error: KafkaError, reason: &str) {
        error!(?error, reason, "librdkafka client error");
    }
}

impl ConsumerContext for KafkaContext {}

type SmartCityConsumer = StreamConsumer<KafkaContext>;

enum KafkaActorMessage {
    Read {
        from_offset: i64,
        respond_to: oneshot::Sender<Result<Vec<KafkaMessage>>>,
    },
    Pending {
        respond_to: oneshot::Sender<Result<Option<usize>>>,
    },
}

struct KafkaActor {
    consumer: Arc<SmartCityConsumer>,
    topic: String,
    partition: i32,
    batch_size: usize,
    read_timeout: Duration,
    /// offset of the next message the consumer will hand out, None until the first assignment.
    position: Option<i64>,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

impl KafkaActor {
    async fn start(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        if !config.kafka_raw_config.is_empty() {
            info!(
                "Applying user-specified kafka config: {}",
                config
                    .kafka_raw_config
                    .keys()
                    .cloned()
                    .collect::<Vec<String>>()
                    .join(", ")
            );
            for (key, value) in &config.kafka_raw_config {
                client_config.set(key, value);
            }
        }
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, config.tls, config.auth);

        let server = config.brokers.join(",");
        let consumer: Arc<SmartCityConsumer> = Arc::new(
            client_config
                .create_with_context(KafkaContext)
                .map_err(|err| Error::Connection {
                    server: server.clone(),
                    error: err.to_string(),
                })?,
        );

        // Creating the consumer does not talk to the brokers, fetching the metadata does. This
        // surfaces unreachable brokers and bad credentials before the actor starts.
        let metadata_consumer = Arc::clone(&consumer);
        let topic = config.topic.clone();
        let partitions = tokio::task::spawn_blocking(move || {
            metadata_consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .filter(|t| t.name() == topic)
                        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                        .collect::<Vec<i32>>()
                })
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for metadata fetch: {e:?}")))?
        .map_err(|err| Error::Connection {
            server,
            error: err.to_string(),
        })?;

        if !partitions.contains(&config.partition) {
            return Err(Error::Kafka(format!(
                "Partition {} of topic {} not found, available partitions: {partitions:?}",
                config.partition, config.topic
            )));
        }

        let actor = KafkaActor {
            consumer,
            topic: config.topic,
            partition: config.partition,
            batch_size,
            read_timeout,
            position: None,
            handler_rx,
        };

        tokio::spawn(async move {
            info!(topic = %actor.topic, partition = actor.partition, "Starting Kafka consumer...");
            // terminates when every KafkaSource handle is dropped
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Read {
                from_offset,
                respond_to,
            } => {
                let messages = self.read_from(from_offset).await;
                if respond_to.send(messages).is_err() {
                    warn!(topic = %self.topic, "Reader went away before the read completed");
                }
            }
            KafkaActorMessage::Pending { respond_to } => {
                let pending = self.pending_messages().await;
                if respond_to.send(pending).is_err() {
                    warn!(topic = %self.topic, "Reader went away before the pending count completed");
                }
            }
        }
    }

    /// Points the consumer at `offset` of the topic-partition.
    fn assign(&mut self, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(offset))
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        self.consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(format!("Failed to assign partition: {e}")))?;
        info!(
            topic = %self.topic,
            partition = self.partition,
            offset,
            "Assigned consumer"
        );
        self.position = Some(offset);
        Ok(())
    }

    /// Reads up to `batch_size` messages starting at `from_offset`, returning early when the read
    /// timeout elapses.
    async fn read_from(&mut self, from_offset: i64) -> Result<Vec<KafkaMessage>> {
        let read = self.read_batch(from_offset).await;
        self.position = next_position(self.position, &read);
        read
    }

    async fn read_batch(&mut self, from_offset: i64) -> Result<Vec<KafkaMessage>> {
        if self.position != Some(from_offset) {
            self.assign(from_offset)?;
        }

        let mut messages: Vec<KafkaMessage> = Vec::with_capacity(self.batch_size);
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        // A successful read resets the failure count.
        let mut continuous_failure_count = 0;
        while messages.len() < self.batch_size {
            tokio::select! {
                biased;

                _ = &mut timeout => break,

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                )));
                            }
                            error!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    // left over from before an assignment
                    if message.offset() < from_offset {
                        continue;
                    }

                    messages.push(KafkaMessage {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        value: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                        key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
                        timestamp: message.timestamp().to_millis(),
                    });
                }
            }
        }

        debug!(topic = %self.topic, msg_count = messages.len(), "Read messages from Kafka");
        Ok(messages)
    }

    /// Messages between the consumer position and the high watermark of the partition.
    async fn pending_messages(&mut self) -> Result<Option<usize>> {
        let Some(position) = self.position else {
            return Ok(None);
        };
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let partition = self.partition;
        let (_low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for watermark fetch: {e:?}")))?
        .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;

        Ok(Some(usize::try_from(high - position).unwrap_or(0)))
    }
}

/// Consumer position after a read: one past the last message, unchanged by an empty read. A failed
/// read may have consumed messages it never returned, so the position is unknown afterwards and
/// the next read reassigns the partition.
fn next_position(current: Option<i64>, read: &Result<Vec<KafkaMessage>>) -> Option<i64> {
    match read {
        Ok(messages) => messages.last().map(|last| last.offset + 1).or(current),
        Err(_) => None,
    }
}

/// Handle to the consumer actor of one topic-partition. Cloning shares the same consumer.
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaSource {
    pub async fn connect(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, batch_size, read_timeout, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    /// Reads the next batch starting at `from_offset`. An empty batch means nothing arrived within
    /// the read timeout.
    pub async fn read_from(&self, from_offset: i64) -> Result<Vec<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Read {
            from_offset,
            respond_to: tx,
        };
        // If send fails, so does the recv.await below.
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn pending_messages(&self) -> Result<Option<usize>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Pending { respond_to: tx };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }
}

#[cfg(test)]
mod position_tests {
    use super::*;

    fn message(offset: i64) -> KafkaMessage {
        KafkaMessage {
            topic: "gps_data".to_string(),
            partition: 0,
            offset,
            value: Bytes::new(),
            key: None,
            timestamp: None,
        }
    }

    #[test]
    fn position_follows_the_last_message() {
        let read = Ok(vec![message(0), message(1), message(2)]);
        assert_eq!(next_position(Some(0), &read), Some(3));
    }

    #[test]
    fn empty_read_keeps_the_position() {
        assert_eq!(next_position(Some(7), &Ok(vec![])), Some(7));
        assert_eq!(next_position(None, &Ok(vec![])), None);
    }

    #[test]
    fn failed_read_forgets_the_position() {
        // the consumer may already be past messages the failed read pulled and dropped, a retry
        // from the same offset must reassign instead of resuming the consumer
        let read = Err(Error::Kafka("Failed to read messages after 10 retries".into()));
        assert_eq!(next_position(Some(0), &read), None);
    }
}

#[cfg(feature = "kafka-tests")]
#[cfg(test)]
mod tests {
    use rdkafka::producer::{FutureProducer, FutureRecord};

    use super::*;

    const BROKERS: &str = "localhost:9092";

    async fn produce(topic: &str, count: usize) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", BROKERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        for i in 0..count {
            let payload = format!("{{\"id\":\"{i}\"}}");
            producer
                .send(
                    FutureRecord::<(), _>::to(topic).payload(&payload),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to produce message");
        }
    }

    fn config(topic: &str) -> KafkaSourceConfig {
        KafkaSourceConfig {
            brokers: vec![BROKERS.to_string()],
            topic: topic.to_string(),
            partition: 0,
            consumer_group: "smartcity-kafka-tests".to_string(),
            auth: None,
            tls: None,
            kafka_raw_config: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn reads_from_explicit_offsets() {
        let topic = "smartcity-kafka-reads-from-explicit-offsets";
        produce(topic, 10).await;

        let source = KafkaSource::connect(config(topic), 5, Duration::from_secs(2))
            .await
            .unwrap();

        let first = source.read_from(0).await.unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(first[0].offset, 0);

        let next = first.last().unwrap().offset + 1;
        let second = source.read_from(next).await.unwrap();
        assert_eq!(second[0].offset, 5);

        // re-reading from an older offset replays the same messages
        let replay = source.read_from(3).await.unwrap();
        assert_eq!(replay[0].offset, 3);
        assert_eq!(replay[0].value, first[3].value);
    }

    #[tokio::test]
    async fn retried_read_returns_the_same_messages() {
        let topic = "smartcity-kafka-retried-read";
        produce(topic, 10).await;

        let source = KafkaSource::connect(config(topic), 3, Duration::from_secs(2))
            .await
            .unwrap();

        let first = source.read_from(0).await.unwrap();
        let offsets: Vec<i64> = first.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);

        // the caller never committed the batch and polls the same offset again
        let retried = source.read_from(0).await.unwrap();
        let offsets: Vec<i64> = retried.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(retried[2].value, first[2].value);

        let next = source.read_from(3).await.unwrap();
        assert_eq!(next[0].offset, 3);
    }

    #[tokio::test]
    async fn unknown_partition_is_rejected() {
        let topic = "smartcity-kafka-unknown-partition";
        produce(topic, 1).await;

        let mut cfg = config(topic);
        cfg.partition = 42;
        let result = KafkaSource::connect(cfg, 5, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Kafka(_))));
    }
}
