//! An in-memory bus with per-topic logs, failure injection and a journal of the offsets polled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::message::RawMessage;
use crate::source::{Polled, SourceFactory, StreamSource};
use crate::{Error, Result};

#[derive(Default)]
struct Failures {
    connects: usize,
    polls: usize,
}

struct BusInner {
    topics: Mutex<HashMap<String, Vec<Bytes>>>,
    failures: Mutex<HashMap<String, Failures>>,
    polled: Mutex<HashMap<String, Vec<i64>>>,
    stalled_pending: Mutex<HashSet<String>>,
    appended: Notify,
    batch_size: usize,
    read_timeout: Duration,
}

#[derive(Clone)]
pub(crate) struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    pub(crate) fn new(batch_size: usize, read_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                polled: Mutex::new(HashMap::new()),
                stalled_pending: Mutex::new(HashSet::new()),
                appended: Notify::new(),
                batch_size,
                read_timeout,
            }),
        }
    }

    /// Appends a message to the topic and returns its offset. Offsets start at 0.
    pub(crate) fn produce(&self, topic: &str, payload: impl Into<Bytes>) -> i64 {
        let offset = {
            let mut topics = self.inner.topics.lock();
            let log = topics.entry(topic.to_string()).or_default();
            log.push(payload.into());
            (log.len() - 1) as i64
        };
        self.inner.appended.notify_waiters();
        offset
    }

    pub(crate) fn produce_json(&self, topic: &str, value: serde_json::Value) -> i64 {
        self.produce(topic, value.to_string())
    }

    /// Pads the topic with empty payloads so that the next message lands at `offset`.
    pub(crate) fn skip_to(&self, topic: &str, offset: i64) {
        let mut topics = self.inner.topics.lock();
        let log = topics.entry(topic.to_string()).or_default();
        while (log.len() as i64) < offset {
            log.push(Bytes::new());
        }
    }

    pub(crate) fn fail_connects(&self, topic: &str, count: usize) {
        self.inner
            .failures
            .lock()
            .entry(topic.to_string())
            .or_default()
            .connects = count;
    }

    pub(crate) fn fail_polls(&self, topic: &str, count: usize) {
        self.inner
            .failures
            .lock()
            .entry(topic.to_string())
            .or_default()
            .polls = count;
    }

    /// Makes every backlog query of the topic hang, like a broker that stopped answering.
    pub(crate) fn stall_pending(&self, topic: &str) {
        self.inner.stalled_pending.lock().insert(topic.to_string());
    }

    /// Offsets requested by every poll of the topic, in order.
    pub(crate) fn polled_offsets(&self, topic: &str) -> Vec<i64> {
        self.inner
            .polled
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn should_fail(&self, topic: &str, pick: impl Fn(&mut Failures) -> &mut usize) -> bool {
        let mut failures = self.inner.failures.lock();
        let Some(failures) = failures.get_mut(topic) else {
            return false;
        };
        let remaining = pick(failures);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    fn read(&self, topic: &str, from_offset: i64) -> Vec<RawMessage> {
        let topics = self.inner.topics.lock();
        let Some(log) = topics.get(topic) else {
            return vec![];
        };
        let start = usize::try_from(from_offset).unwrap_or(0);
        log.iter()
            .enumerate()
            .skip(start)
            .take(self.inner.batch_size)
            .map(|(offset, payload)| RawMessage {
                topic: topic.to_string(),
                offset: offset as i64,
                payload: payload.clone(),
            })
            .collect()
    }
}

impl SourceFactory for InMemoryBus {
    type Source = InMemorySource;

    async fn connect(&self, topic: &str) -> Result<InMemorySource> {
        if self.should_fail(topic, |f| &mut f.connects) {
            return Err(Error::SourceConnection(format!(
                "injected connect failure for {topic}"
            )));
        }
        Ok(InMemorySource {
            bus: self.clone(),
            topic: topic.to_string(),
            position: Mutex::new(None),
        })
    }
}

pub(crate) struct InMemorySource {
    bus: InMemoryBus,
    topic: String,
    position: Mutex<Option<i64>>,
}

impl StreamSource for InMemorySource {
    async fn poll(&self, from_offset: i64) -> Result<Polled> {
        self.bus
            .inner
            .polled
            .lock()
            .entry(self.topic.clone())
            .or_default()
            .push(from_offset);

        if self.bus.should_fail(&self.topic, |f| &mut f.polls) {
            return Err(Error::Source(format!(
                "injected poll failure for {}",
                self.topic
            )));
        }

        let deadline = Instant::now() + self.bus.inner.read_timeout;
        loop {
            // registered before reading so that an append in between is not missed
            let appended = self.bus.inner.appended.notified();
            let messages = self.bus.read(&self.topic, from_offset);
            if !messages.is_empty() {
                let polled = Polled::new(from_offset, messages);
                *self.position.lock() = Some(polled.next_offset);
                return Ok(polled);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Polled::new(from_offset, vec![]));
            }
        }
    }

    async fn pending(&self) -> Result<Option<usize>> {
        let stalled = self.bus.inner.stalled_pending.lock().contains(&self.topic);
        if stalled {
            std::future::pending::<()>().await;
        }
        let Some(position) = *self.position.lock() else {
            return Ok(None);
        };
        let len = self
            .bus
            .inner
            .topics
            .lock()
            .get(&self.topic)
            .map_or(0, Vec::len) as i64;
        Ok(Some(usize::try_from(len - position).unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn polls_from_requested_offset() {
        let bus = InMemoryBus::new(2, Duration::from_millis(10));
        for i in 0..5 {
            bus.produce("gps_data", format!("{i}"));
        }
        let source = bus.connect("gps_data").await.unwrap();

        let first = source.poll(0).await.unwrap();
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.next_offset, 2);
        assert_eq!(source.pending().await.unwrap(), Some(3));

        let replay = source.poll(1).await.unwrap();
        assert_eq!(replay.messages[0].payload, Bytes::from("1"));

        let tail = source.poll(5).await.unwrap();
        assert!(tail.is_empty());
        assert_eq!(tail.next_offset, 5);

        assert_eq!(bus.polled_offsets("gps_data"), vec![0, 1, 5]);
    }

    #[tokio::test]
    async fn poll_wakes_up_on_append() {
        let bus = InMemoryBus::new(10, Duration::from_secs(5));
        let source = bus.connect("traffic_data").await.unwrap();

        let producer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("traffic_data", "{}");
        });

        let polled = tokio::time::timeout(Duration::from_secs(1), source.poll(0))
            .await
            .expect("poll should return once a message is appended")
            .unwrap();
        assert_eq!(polled.messages.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures() {
        let bus = InMemoryBus::new(10, Duration::from_millis(10));
        bus.fail_connects("weather_data", 1);
        bus.fail_polls("weather_data", 1);

        assert!(matches!(
            bus.connect("weather_data").await,
            Err(Error::SourceConnection(_))
        ));
        let source = bus.connect("weather_data").await.unwrap();
        assert!(matches!(source.poll(0).await, Err(Error::Source(_))));
        assert!(source.poll(0).await.is_ok());

        // other topics are unaffected
        assert!(bus.connect("gps_data").await.is_ok());
    }

    #[test]
    fn skip_to_offset() {
        let bus = InMemoryBus::new(10, Duration::from_millis(10));
        bus.skip_to("weather_data", 100);
        assert_eq!(bus.produce("weather_data", "{}"), 100);
    }
}
