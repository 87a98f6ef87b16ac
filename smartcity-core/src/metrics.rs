use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;
use crate::pipeline::ChainState;

// The top-level metric registry is created with the GLOBAL_PREFIX
const GLOBAL_PREFIX: &str = "smartcity";

const STREAM_LABEL: &str = "stream";

// counters, the _total suffix is added by the prometheus client library based on the metric type
const READ_TOTAL: &str = "read";
const DECODE_ERRORS_TOTAL: &str = "decode_errors";
const LATE_RECORDS_TOTAL: &str = "late_records";
const ADMITTED_TOTAL: &str = "admitted";
const SINK_WRITE_TOTAL: &str = "sink_write";
const SINK_BYTES_TOTAL: &str = "sink_bytes";

// gauges
const CHECKPOINT_OFFSET: &str = "checkpoint_offset";
const WATERMARK_MS: &str = "watermark_ms";
const CHAIN_STATE: &str = "chain_state";
const SOURCE_PENDING: &str = "source_pending";

/// The global register of all metrics.
struct GlobalRegistry {
    // It is okay to use a blocking mutex because every metric is registered only once.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(GLOBAL_PREFIX)),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

pub(crate) type Labels = Vec<(String, String)>;

/// Metrics of the ingestion chains, every family is labelled by stream.
pub(crate) struct PipelineMetrics {
    pub(crate) read_total: Family<Labels, Counter>,
    pub(crate) decode_errors_total: Family<Labels, Counter>,
    pub(crate) late_records_total: Family<Labels, Counter>,
    pub(crate) admitted_total: Family<Labels, Counter>,
    pub(crate) sink_write_total: Family<Labels, Counter>,
    pub(crate) sink_bytes_total: Family<Labels, Counter>,

    pub(crate) checkpoint_offset: Family<Labels, Gauge>,
    pub(crate) watermark_ms: Family<Labels, Gauge>,
    /// [`ChainState`] as a number, see [`ChainState::code`].
    pub(crate) chain_state: Family<Labels, Gauge>,
    pub(crate) source_pending: Family<Labels, Gauge>,
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::default(),
            decode_errors_total: Family::default(),
            late_records_total: Family::default(),
            admitted_total: Family::default(),
            sink_write_total: Family::default(),
            sink_bytes_total: Family::default(),
            checkpoint_offset: Family::default(),
            watermark_ms: Family::default(),
            chain_state: Family::default(),
            source_pending: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            READ_TOTAL,
            "Total number of messages read from the bus",
            metrics.read_total.clone(),
        );
        registry.register(
            DECODE_ERRORS_TOTAL,
            "Total number of messages that failed to decode",
            metrics.decode_errors_total.clone(),
        );
        registry.register(
            LATE_RECORDS_TOTAL,
            "Total number of records dropped for arriving behind the watermark",
            metrics.late_records_total.clone(),
        );
        registry.register(
            ADMITTED_TOTAL,
            "Total number of records admitted to the sink",
            metrics.admitted_total.clone(),
        );
        registry.register(
            SINK_WRITE_TOTAL,
            "Total number of records written to the store",
            metrics.sink_write_total.clone(),
        );
        registry.register(
            SINK_BYTES_TOTAL,
            "Total number of bytes written to the store",
            metrics.sink_bytes_total.clone(),
        );
        registry.register(
            CHECKPOINT_OFFSET,
            "First offset not yet committed",
            metrics.checkpoint_offset.clone(),
        );
        registry.register(
            WATERMARK_MS,
            "Current watermark in milliseconds since epoch",
            metrics.watermark_ms.clone(),
        );
        registry.register(
            CHAIN_STATE,
            "State of the chain: 0 starting, 1 running, 2 draining, 3 stopped, 4 failed",
            metrics.chain_state.clone(),
        );
        registry.register(
            SOURCE_PENDING,
            "Messages on the bus not yet read",
            metrics.source_pending.clone(),
        );
        metrics
    }
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub(crate) fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

pub(crate) fn stream_labels(stream: &str) -> Labels {
    vec![(STREAM_LABEL.to_string(), stream.to_string())]
}

/// Handle to the metrics of the process, kept in the pipeline context.
#[derive(Clone, Copy)]
pub struct MetricsHandle {
    metrics: &'static PipelineMetrics,
}

impl MetricsHandle {
    pub fn global() -> Self {
        Self {
            metrics: pipeline_metrics(),
        }
    }

    pub(crate) fn get(&self) -> &'static PipelineMetrics {
        self.metrics
    }
}

/// Chain states watched by the readiness probe.
#[derive(Clone)]
pub(crate) struct Readiness {
    states: Arc<Vec<watch::Receiver<ChainState>>>,
}

impl Readiness {
    pub(crate) fn new(states: Vec<watch::Receiver<ChainState>>) -> Self {
        Self {
            states: Arc::new(states),
        }
    }

    fn is_ready(&self) -> bool {
        self.states
            .iter()
            .all(|state| *state.borrow() == ChainState::Running)
    }
}

// metrics_handler is used to generate and return a snapshot of the
// current state of the metrics in the global registry
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    {
        let state = global_registry().registry.lock();
        if let Err(e) = encode(&mut buffer, &state) {
            error!(?e, "Failed to encode metrics");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    debug!("Exposing metrics: {:?}", buffer);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Serves the metrics and health endpoints until the token is cancelled.
pub(crate) async fn start_metrics_server(
    addr: SocketAddr,
    readiness: Readiness,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(%addr, "Started metrics server");

    axum::serve(listener, metrics_router(readiness))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))?;
    Ok(())
}

/// router for metrics and health endpoints
fn metrics_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Ready once every chain is running.
async fn readyz(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn metrics_are_exposed_per_stream() {
        let metrics = pipeline_metrics();
        metrics
            .read_total
            .get_or_create(&stream_labels("metrics_test_stream"))
            .inc_by(3);
        metrics
            .checkpoint_offset
            .get_or_create(&stream_labels("metrics_test_stream"))
            .set(110);

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(r#"smartcity_read_total{stream="metrics_test_stream"} 3"#));
        assert!(body.contains(r#"smartcity_checkpoint_offset{stream="metrics_test_stream"} 110"#));
    }

    #[tokio::test]
    async fn readiness_follows_chain_states() {
        let (running_tx, running_rx) = watch::channel(ChainState::Running);
        let (starting_tx, starting_rx) = watch::channel(ChainState::Starting);
        let router = metrics_router(Readiness::new(vec![running_rx, starting_rx]));

        let readyz = || Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(readyz()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        starting_tx.send(ChainState::Running).unwrap();
        let response = router.clone().oneshot(readyz()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        running_tx.send(ChainState::Failed).unwrap();
        let response = router.clone().oneshot(readyz()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let livez = Request::builder().uri("/livez").body(Body::empty()).unwrap();
        let response = router.oneshot(livez).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
