//! A chain owns everything of one stream: its source, its sink, its watermark and its checkpoint.
//!
//! ```text
//! Starting --> Running --> Draining --> Stopped
//!    |            |
//!    +------------+--> Failed
//! ```
//!
//! Batches are handled strictly in offset order and a batch is either checkpointed as a whole or
//! not at all. Cancellation abandons a poll or a backlog sample in flight, never an append or a
//! commit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::StreamSettings;
use crate::decoder::decode;
use crate::message::{OffsetRange, TypedRecord};
use crate::metrics::{Labels, stream_labels};
use crate::pipeline::{ChainState, PipelineContext};
use crate::sink::{Reject, SinkWriter};
use crate::source::{Polled, SourceFactory, StreamSource};
use crate::watermark::{Admission, WatermarkState};
use crate::{Error, Result};

/// How often the backlog of the bus is sampled for the `source_pending` gauge.
const PENDING_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

fn transient(e: &Error) -> bool {
    e.is_retryable()
}

/// Running totals of a chain since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainCounters {
    pub read: u64,
    pub decode_errors: u64,
    pub late: u64,
    pub admitted: u64,
    pub written: u64,
    pub duplicates_skipped: u64,
    pub batches: u64,
}

#[derive(Debug, Clone)]
pub struct ChainReport {
    pub stream: &'static str,
    pub final_state: ChainState,
    /// First offset not yet committed, None if the chain never committed.
    pub last_committed_offset: Option<i64>,
    pub counters: ChainCounters,
    pub error: Option<Error>,
}

impl ChainReport {
    /// Report of a chain whose task ended without reporting.
    pub(crate) fn aborted(stream: &'static str) -> Self {
        Self {
            stream,
            final_state: ChainState::Failed,
            last_committed_offset: None,
            counters: ChainCounters::default(),
            error: None,
        }
    }
}

impl fmt::Display for ChainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stream, self.final_state)?;
        match self.last_committed_offset {
            Some(offset) => write!(f, ", committed up to {offset}")?,
            None => write!(f, ", nothing committed")?,
        }
        write!(
            f,
            ", read {} admitted {} late {} malformed {}",
            self.counters.read, self.counters.admitted, self.counters.late, self.counters.decode_errors
        )?;
        if let Some(error) = &self.error {
            write!(f, ", error: {error}")?;
        }
        Ok(())
    }
}

/// What a started chain works with.
struct Started<S> {
    source: S,
    sink: SinkWriter,
    watermark: WatermarkState,
    next_offset: i64,
}

/// The ingestion of one stream, generic over where the messages come from.
pub struct StreamChain<F: SourceFactory> {
    ctx: PipelineContext,
    stream: StreamSettings,
    factory: Arc<F>,
    checkpoints: CheckpointStore,
    state: watch::Sender<ChainState>,
    counters: ChainCounters,
    last_committed_offset: Option<i64>,
    labels: Labels,
}

impl<F: SourceFactory> StreamChain<F> {
    pub fn new(ctx: PipelineContext, stream: StreamSettings, factory: Arc<F>) -> Self {
        let checkpoints = CheckpointStore::new(Arc::clone(&ctx.store), ctx.root.clone());
        let (state, _) = watch::channel(ChainState::Starting);
        let labels = stream_labels(stream.definition.name);
        Self {
            ctx,
            stream,
            factory,
            checkpoints,
            state,
            counters: ChainCounters::default(),
            last_committed_offset: None,
            labels,
        }
    }

    pub fn name(&self) -> &'static str {
        self.stream.definition.name
    }

    pub fn state(&self) -> watch::Receiver<ChainState> {
        self.state.subscribe()
    }

    /// Runs the chain until the context is cancelled or an error outlasts its retries.
    pub async fn run(mut self) -> ChainReport {
        self.set_state(ChainState::Starting);
        let error = match self.run_until_cancelled().await {
            Ok(()) => {
                self.set_state(ChainState::Stopped);
                info!(
                    stream = self.name(),
                    last_committed_offset = ?self.last_committed_offset,
                    "Chain stopped"
                );
                None
            }
            Err(e) => {
                self.set_state(ChainState::Failed);
                error!(
                    stream = self.name(),
                    ?e,
                    last_committed_offset = ?self.last_committed_offset,
                    "Chain failed"
                );
                Some(e)
            }
        };

        ChainReport {
            stream: self.name(),
            final_state: *self.state.borrow(),
            last_committed_offset: self.last_committed_offset,
            counters: self.counters,
            error,
        }
    }

    async fn run_until_cancelled(&mut self) -> Result<()> {
        let name = self.name();
        let cancel = self.ctx.cancel.clone();
        let mut started = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(stream = name, "Cancelled while starting");
                return Ok(());
            }
            started = self.start() => started?,
        };
        self.set_state(ChainState::Running);
        info!(
            stream = name,
            topic = %self.stream.topic,
            offset = started.next_offset,
            "Chain running"
        );

        let mut pending_sampled_at = None;
        loop {
            let from_offset = started.next_offset;
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.poll(&started.source, from_offset) => polled?,
            };
            if !polled.is_empty() {
                self.process(&mut started, polled).await?;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.sample_pending(&started.source, &mut pending_sampled_at) => {}
            }
        }

        // the last batch was committed before the loop observed the cancellation
        self.drain_if_cancelled();
        info!(
            stream = name,
            next_offset = started.next_offset,
            "Draining chain"
        );
        Ok(())
    }

    /// Connects the source, loads the checkpoint, recovers the sink and restores the watermark.
    async fn start(&mut self) -> Result<Started<F::Source>> {
        let name = self.name();
        let retry = self.ctx.settings.retry;

        let factory = self.factory.as_ref();
        let topic = self.stream.topic.as_str();
        let source = Retry::new(retry.backoff(), move || factory.connect(topic), transient).await?;

        let checkpoints = &self.checkpoints;
        let checkpoint = Retry::new(retry.backoff(), move || checkpoints.load(name), transient).await?;
        if let Some(checkpoint) = &checkpoint
            && checkpoint.sink_path_prefix != self.ctx.settings.storage.prefix
        {
            warn!(
                stream = name,
                previous = %checkpoint.sink_path_prefix,
                current = %self.ctx.settings.storage.prefix,
                "Checkpoint was committed under another storage prefix"
            );
        }

        let store = &self.ctx.store;
        let root = &self.ctx.root;
        let definition = self.stream.definition;
        let sink = Retry::new(
            retry.backoff(),
            move || SinkWriter::recover(Arc::clone(store), root, definition),
            transient,
        )
        .await?
        .with_retry(retry);

        let (next_offset, max_event_time) = match checkpoint {
            Some(checkpoint) => {
                self.last_committed_offset = Some(checkpoint.last_committed_offset);
                self.ctx
                    .metrics
                    .get()
                    .checkpoint_offset
                    .get_or_create(&self.labels)
                    .set(checkpoint.last_committed_offset);
                (checkpoint.last_committed_offset, checkpoint.max_event_time)
            }
            None => (self.ctx.settings.starting_offset, None),
        };
        let watermark = WatermarkState::resume(name, self.stream.lateness_tolerance, max_event_time);

        Ok(Started {
            source,
            sink,
            watermark,
            next_offset,
        })
    }

    async fn poll(&self, source: &F::Source, from_offset: i64) -> Result<Polled> {
        Retry::new(
            self.ctx.settings.retry.backoff(),
            move || source.poll(from_offset),
            transient,
        )
        .await
    }

    /// Decodes, admits, appends and checkpoints one polled batch.
    async fn process(&mut self, started: &mut Started<F::Source>, polled: Polled) -> Result<()> {
        let Some(range) = OffsetRange::of(&polled.messages) else {
            return Ok(());
        };
        let name = self.name();
        let metrics = self.ctx.metrics.get();
        let read = polled.messages.len() as u64;

        let mut admitted: Vec<TypedRecord> = Vec::with_capacity(polled.messages.len());
        let mut rejects = Vec::new();
        let mut late = 0u64;
        let mut decode_errors = 0u64;
        for raw in &polled.messages {
            match decode(raw, self.stream.definition) {
                Ok(record) => match started.watermark.admit(&record) {
                    Admission::Admitted => admitted.push(record),
                    Admission::Late { watermark } => {
                        late += 1;
                        debug!(
                            stream = name,
                            offset = record.offset,
                            event_time = %record.event_time,
                            %watermark,
                            "Dropping late record"
                        );
                    }
                },
                Err(e) => {
                    decode_errors += 1;
                    warn!(stream = name, offset = raw.offset, error = %e, "Skipping malformed message");
                    if self.ctx.settings.dead_letter_enabled {
                        rejects.push(Reject {
                            offset: raw.offset,
                            reason: e.reason,
                            payload: String::from_utf8_lossy(&raw.payload).into_owned(),
                        });
                    }
                }
            }
        }
        let admitted_count = admitted.len() as u64;

        self.counters.read += read;
        self.counters.late += late;
        self.counters.decode_errors += decode_errors;
        self.counters.admitted += admitted_count;
        metrics.read_total.get_or_create(&self.labels).inc_by(read);
        metrics.late_records_total.get_or_create(&self.labels).inc_by(late);
        metrics
            .decode_errors_total
            .get_or_create(&self.labels)
            .inc_by(decode_errors);
        metrics
            .admitted_total
            .get_or_create(&self.labels)
            .inc_by(admitted_count);

        // stop polling after this batch, it is still appended and committed
        self.drain_if_cancelled();

        if !rejects.is_empty() {
            started.sink.append_rejects(&rejects, range).await?;
        }
        let result = started.sink.append(admitted, range).await?;
        self.counters.written += result.records_written as u64;
        self.counters.duplicates_skipped += result.duplicates_skipped as u64;
        metrics
            .sink_write_total
            .get_or_create(&self.labels)
            .inc_by(result.records_written as u64);
        metrics
            .sink_bytes_total
            .get_or_create(&self.labels)
            .inc_by(result.bytes_written as u64);

        // the data of the batch is durable, the checkpoint may move past it
        let checkpoint = Checkpoint {
            stream: name.to_string(),
            last_committed_offset: polled.next_offset,
            sink_path_prefix: self.ctx.settings.storage.prefix.clone(),
            max_event_time: started.watermark.max_event_time_seen(),
            committed_at: Utc::now(),
        };
        self.drain_if_cancelled();
        let checkpoints = &self.checkpoints;
        let to_commit = &checkpoint;
        Retry::new(
            self.ctx.settings.retry.backoff(),
            move || checkpoints.commit(to_commit),
            transient,
        )
        .await?;

        started.next_offset = polled.next_offset;
        self.last_committed_offset = Some(polled.next_offset);
        self.counters.batches += 1;
        metrics
            .checkpoint_offset
            .get_or_create(&self.labels)
            .set(polled.next_offset);
        if let Some(watermark) = started.watermark.watermark() {
            metrics
                .watermark_ms
                .get_or_create(&self.labels)
                .set(watermark.timestamp_millis());
        }

        debug!(
            stream = name,
            %range,
            admitted = admitted_count,
            written = result.records_written,
            late,
            decode_errors,
            "Committed batch"
        );
        Ok(())
    }

    async fn sample_pending(&self, source: &F::Source, sampled_at: &mut Option<Instant>) {
        if sampled_at.is_some_and(|at| at.elapsed() < PENDING_REFRESH_INTERVAL) {
            return;
        }
        *sampled_at = Some(Instant::now());
        match source.pending().await {
            Ok(Some(pending)) => {
                self.ctx
                    .metrics
                    .get()
                    .source_pending
                    .get_or_create(&self.labels)
                    .set(i64::try_from(pending).unwrap_or(i64::MAX));
            }
            Ok(None) => {}
            Err(e) => debug!(stream = self.name(), ?e, "Could not sample pending messages"),
        }
    }

    fn drain_if_cancelled(&self) {
        if self.ctx.cancel.is_cancelled() && *self.state.borrow() == ChainState::Running {
            self.set_state(ChainState::Draining);
        }
    }

    fn set_state(&self, state: ChainState) {
        self.state.send_replace(state);
        self.ctx
            .metrics
            .get()
            .chain_state
            .get_or_create(&self.labels)
            .set(state.code());
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Settings;
    use crate::sink::parquet;
    use crate::source::test_utils::InMemoryBus;

    struct Harness {
        bus: InMemoryBus,
        store: Arc<dyn ObjectStore>,
        ctx: PipelineContext,
    }

    impl Harness {
        fn new(overrides: &[(&str, &str)]) -> Self {
            let mut env = vec![
                ("SMARTCITY_STORAGE_PREFIX", "memory://city"),
                ("SMARTCITY_READ_BATCH_SIZE", "10"),
                ("SMARTCITY_READ_TIMEOUT", "20ms"),
                ("SMARTCITY_RETRY_MAX_ATTEMPTS", "5"),
                ("SMARTCITY_RETRY_BASE_INTERVAL", "1ms"),
                ("SMARTCITY_RETRY_MAX_INTERVAL", "5ms"),
            ];
            env.extend_from_slice(overrides);
            let settings = Settings::load(env).unwrap();
            let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
            let ctx = PipelineContext::with_store(
                settings,
                Arc::clone(&store),
                Path::from("city"),
                CancellationToken::new(),
            );
            Self {
                bus: InMemoryBus::new(10, Duration::from_millis(20)),
                store,
                ctx,
            }
        }

        fn checkpoints(&self) -> CheckpointStore {
            CheckpointStore::new(Arc::clone(&self.store), self.ctx.root.clone())
        }

        /// Starts the chain with a fresh cancellation token.
        fn spawn(&mut self, stream: &str) -> (watch::Receiver<ChainState>, JoinHandle<ChainReport>) {
            self.ctx.cancel = CancellationToken::new();
            let chain = StreamChain::new(
                self.ctx.clone(),
                self.ctx.settings.stream(stream).unwrap().clone(),
                Arc::new(self.bus.clone()),
            );
            let state = chain.state();
            (state, tokio::spawn(chain.run()))
        }

        async fn wait_for_offset(&self, stream: &str, offset: i64) {
            let checkpoints = self.checkpoints();
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Ok(Some(checkpoint)) = checkpoints.load(stream).await
                        && checkpoint.last_committed_offset >= offset
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("{stream} did not commit offset {offset}"));
        }

        async fn stop(&self, handle: JoinHandle<ChainReport>) -> ChainReport {
            self.ctx.cancel.cancel();
            handle.await.unwrap()
        }

        async fn persisted_offsets(&self, stream: &str) -> Vec<i64> {
            let mut parts: Vec<Path> = self
                .store
                .list(Some(&Path::from(format!("city/data/{stream}"))))
                .map_ok(|meta| meta.location)
                .try_collect()
                .await
                .unwrap();
            parts.sort();
            let mut offsets = Vec::new();
            for part in parts {
                let bytes = self.store.get(&part).await.unwrap().bytes().await.unwrap();
                offsets.extend(parquet::read_offsets(bytes));
            }
            offsets
        }
    }

    fn weather(i: i64) -> serde_json::Value {
        serde_json::json!({
            "id": format!("weather-{i}"),
            "deviceId": "Vehicle-123",
            "location": "(51.5074, -0.1278)",
            "timestamp": format!("2024-03-01T10:{:02}:00", i % 60),
            "temperature": 21.5,
            "weatherCondition": "Sunny",
            "humidity": 60,
        })
    }

    #[tokio::test]
    async fn restart_resumes_from_checkpoint() {
        let mut harness = Harness::new(&[]);
        harness.bus.skip_to("weather_data", 100);
        for i in 100..115 {
            harness.bus.produce_json("weather_data", weather(i));
        }
        // an earlier run committed 100..=109
        harness
            .checkpoints()
            .commit(&Checkpoint {
                stream: "weather_data".to_string(),
                last_committed_offset: 110,
                sink_path_prefix: "memory://city".to_string(),
                max_event_time: None,
                committed_at: Utc::now(),
            })
            .await
            .unwrap();

        let (mut state, handle) = harness.spawn("weather_data");
        state
            .wait_for(|state| *state == ChainState::Running)
            .await
            .unwrap();
        harness.wait_for_offset("weather_data", 115).await;
        let report = harness.stop(handle).await;

        assert_eq!(harness.bus.polled_offsets("weather_data")[0], 110);
        assert_eq!(report.final_state, ChainState::Stopped);
        assert_eq!(report.last_committed_offset, Some(115));
        assert_eq!(report.counters.read, 5);
        assert_eq!(report.counters.admitted, 5);
        assert_eq!(
            harness.persisted_offsets("weather_data").await,
            vec![110, 111, 112, 113, 114]
        );
        assert_eq!(*state.borrow(), ChainState::Stopped);
    }

    #[tokio::test]
    async fn malformed_messages_are_counted_and_dead_lettered() {
        let mut harness = Harness::new(&[]);
        for i in 0..3 {
            harness.bus.produce_json("weather_data", weather(i));
        }
        harness.bus.produce("weather_data", "{\"id\": \"broken\"");
        for i in 3..5 {
            harness.bus.produce_json("weather_data", weather(i));
        }

        let (state, handle) = harness.spawn("weather_data");
        harness.wait_for_offset("weather_data", 6).await;
        assert_eq!(*state.borrow(), ChainState::Running);
        let report = harness.stop(handle).await;

        assert_eq!(report.final_state, ChainState::Stopped);
        assert_eq!(report.counters.read, 6);
        assert_eq!(report.counters.admitted, 5);
        assert_eq!(report.counters.decode_errors, 1);
        assert!(report.error.is_none());
        assert_eq!(
            harness.persisted_offsets("weather_data").await,
            vec![0, 1, 2, 4, 5]
        );

        let errors: Vec<_> = harness
            .store
            .list(Some(&Path::from("city/errors/weather_data")))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        let body = harness
            .store
            .get(&errors[0].location)
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let line: serde_json::Value =
            serde_json::from_slice(body.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(line["offset"], 3);
    }

    #[tokio::test]
    async fn dead_letters_can_be_disabled() {
        let mut harness = Harness::new(&[("SMARTCITY_DEAD_LETTER_ENABLED", "false")]);
        harness.bus.produce("gps_data", "not json");
        harness.bus.produce_json(
            "gps_data",
            serde_json::json!({"id": "g", "timestamp": "2024-03-01T10:00:00"}),
        );

        let (_, handle) = harness.spawn("gps_data");
        harness.wait_for_offset("gps_data", 2).await;
        let report = harness.stop(handle).await;

        assert_eq!(report.counters.decode_errors, 1);
        let errors: Vec<_> = harness
            .store
            .list(Some(&Path::from("city/errors/gps_data")))
            .try_collect()
            .await
            .unwrap();
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn late_records_are_dropped() {
        let mut harness = Harness::new(&[]);
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        // the last record is six minutes behind the maximum
        for minutes in [0, 1, 6, 0] {
            let event_time = t + chrono::TimeDelta::minutes(minutes);
            harness.bus.produce_json(
                "vehicle_data",
                serde_json::json!({
                    "id": format!("v-{minutes}"),
                    "timestamp": event_time.to_rfc3339(),
                    "speed": 42.0,
                }),
            );
        }

        let (_, handle) = harness.spawn("vehicle_data");
        harness.wait_for_offset("vehicle_data", 4).await;
        let report = harness.stop(handle).await;

        assert_eq!(report.counters.admitted, 3);
        assert_eq!(report.counters.late, 1);
        assert_eq!(harness.persisted_offsets("vehicle_data").await, vec![0, 1, 2]);

        let checkpoint = harness
            .checkpoints()
            .load("vehicle_data")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            checkpoint.max_event_time,
            Some(t + chrono::TimeDelta::minutes(6))
        );
    }

    #[tokio::test]
    async fn watermark_survives_restart() {
        let mut harness = Harness::new(&[]);
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let vehicle = |minutes: i64| {
            serde_json::json!({
                "id": format!("v-{minutes}"),
                "timestamp": (t + chrono::TimeDelta::minutes(minutes)).to_rfc3339(),
            })
        };
        harness.bus.produce_json("vehicle_data", vehicle(10));

        let (_, handle) = harness.spawn("vehicle_data");
        harness.wait_for_offset("vehicle_data", 1).await;
        harness.stop(handle).await;

        // four minutes behind the restored maximum is admitted, six is late
        harness.bus.produce_json("vehicle_data", vehicle(6));
        harness.bus.produce_json("vehicle_data", vehicle(4));
        let (_, handle) = harness.spawn("vehicle_data");
        harness.wait_for_offset("vehicle_data", 3).await;
        let report = harness.stop(handle).await;

        assert_eq!(report.counters.admitted, 1);
        assert_eq!(report.counters.late, 1);
    }

    #[tokio::test]
    async fn crash_between_write_and_commit_is_replayed_without_duplicates() {
        let mut harness = Harness::new(&[]);
        for i in 0..15 {
            harness.bus.produce_json("weather_data", weather(i));
        }

        // a previous run persisted 0..=9 and crashed before its checkpoint
        let records: Vec<TypedRecord> = (0..10)
            .map(|i| {
                let raw = crate::message::RawMessage {
                    topic: "weather_data".to_string(),
                    offset: i,
                    payload: bytes::Bytes::from(weather(i).to_string()),
                };
                decode(&raw, crate::schema::find("weather_data").unwrap()).unwrap()
            })
            .collect();
        let mut sink = SinkWriter::recover(
            Arc::clone(&harness.store),
            &harness.ctx.root,
            crate::schema::find("weather_data").unwrap(),
        )
        .await
        .unwrap();
        sink.append(records, OffsetRange::new(0, 9)).await.unwrap();

        let (_, handle) = harness.spawn("weather_data");
        harness.wait_for_offset("weather_data", 15).await;
        let report = harness.stop(handle).await;

        assert_eq!(harness.bus.polled_offsets("weather_data")[0], 0);
        assert_eq!(report.counters.duplicates_skipped, 10);
        assert_eq!(report.counters.written, 5);
        assert_eq!(
            harness.persisted_offsets("weather_data").await,
            (0..15).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn transient_source_failures_are_retried() {
        let mut harness = Harness::new(&[]);
        harness.bus.fail_connects("traffic_data", 2);
        harness.bus.fail_polls("traffic_data", 2);
        harness.bus.produce_json(
            "traffic_data",
            serde_json::json!({"id": "t", "cameraId": "Camera123", "timestamp": "2024-03-01 10:00:00"}),
        );

        let (_, handle) = harness.spawn("traffic_data");
        harness.wait_for_offset("traffic_data", 1).await;
        let report = harness.stop(handle).await;

        assert_eq!(report.final_state, ChainState::Stopped);
        assert_eq!(report.counters.admitted, 1);
        // the failed polls asked for the same offset again
        assert_eq!(&harness.bus.polled_offsets("traffic_data")[..3], &[0, 0, 0]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_chain_with_its_last_commit() {
        let mut harness = Harness::new(&[]);
        harness.bus.produce_json(
            "gps_data",
            serde_json::json!({"id": "g", "timestamp": "2024-03-01T10:00:00"}),
        );

        let (state, handle) = harness.spawn("gps_data");
        harness.wait_for_offset("gps_data", 1).await;
        harness.bus.fail_polls("gps_data", usize::MAX);

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.final_state, ChainState::Failed);
        assert_eq!(report.last_committed_offset, Some(1));
        assert!(matches!(report.error, Some(Error::Source(_))));
        assert_eq!(*state.borrow(), ChainState::Failed);
    }

    #[tokio::test]
    async fn cancellation_with_a_batch_in_hand_drains_and_commits_it() {
        let harness = Harness::new(&[]);
        for i in 0..3 {
            harness.bus.produce_json("weather_data", weather(i));
        }
        let mut chain = StreamChain::new(
            harness.ctx.clone(),
            harness.ctx.settings.stream("weather_data").unwrap().clone(),
            Arc::new(harness.bus.clone()),
        );
        let state = chain.state();
        let mut started = chain.start().await.unwrap();
        chain.set_state(ChainState::Running);
        let polled = started.source.poll(started.next_offset).await.unwrap();

        // the shutdown signal arrives between the poll and the append
        harness.ctx.cancel.cancel();
        chain.process(&mut started, polled).await.unwrap();

        assert_eq!(*state.borrow(), ChainState::Draining);
        assert_eq!(started.next_offset, 3);
        let checkpoint = harness.checkpoints().load("weather_data").await.unwrap().unwrap();
        assert_eq!(checkpoint.last_committed_offset, 3);
        assert_eq!(harness.persisted_offsets("weather_data").await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn stalled_backlog_sample_does_not_hold_up_shutdown() {
        let mut harness = Harness::new(&[]);
        harness.bus.stall_pending("gps_data");

        let (mut state, handle) = harness.spawn("gps_data");
        state
            .wait_for(|state| *state == ChainState::Running)
            .await
            .unwrap();
        // the first backlog sample follows the first poll and never returns
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = tokio::time::timeout(Duration::from_secs(1), harness.stop(handle))
            .await
            .expect("chain should stop while its backlog sample hangs");
        assert_eq!(report.final_state, ChainState::Stopped);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn cancelled_while_starting() {
        let mut harness = Harness::new(&[("SMARTCITY_RETRY_BASE_INTERVAL", "1s"), ("SMARTCITY_RETRY_MAX_INTERVAL", "1s")]);
        harness.bus.fail_connects("emergency_data", usize::MAX);

        let (_, handle) = harness.spawn("emergency_data");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = harness.stop(handle).await;

        assert_eq!(report.final_state, ChainState::Stopped);
        assert_eq!(report.last_committed_offset, None);
        assert!(report.error.is_none());
    }
}
