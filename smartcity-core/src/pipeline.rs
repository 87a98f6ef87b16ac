use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use object_store::ObjectStore;
use object_store::path::Path;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::config::Settings;
use crate::metrics::{MetricsHandle, Readiness, start_metrics_server};
use crate::source::{KafkaSourceFactory, SourceFactory};

/// [chain] moves a single stream from its topic to the store. It executes the following in a loop
/// till a shutdown signal is received:
/// - Poll a batch from the source, starting at the offset after the last commit
/// - Decode the batch and drop what the watermark deems late
/// - Append the admitted records as one part
/// - Commit the checkpoint of the batch
mod chain;
pub use chain::{ChainCounters, ChainReport, StreamChain};

/// Lifecycle of a chain, published on a watch channel per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Starting,
    Running,
    /// Stopped polling, finishing the batch in hand.
    Draining,
    Stopped,
    Failed,
}

impl ChainState {
    /// Numeric form exported by the `chain_state` gauge.
    pub fn code(&self) -> i64 {
        match self {
            ChainState::Starting => 0,
            ChainState::Running => 1,
            ChainState::Draining => 2,
            ChainState::Stopped => 3,
            ChainState::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainState::Stopped | ChainState::Failed)
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ChainState::Starting => "starting",
            ChainState::Running => "running",
            ChainState::Draining => "draining",
            ChainState::Stopped => "stopped",
            ChainState::Failed => "failed",
        };
        f.write_str(state)
    }
}

/// Process wide state, built once at startup and handed to every chain.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn ObjectStore>,
    /// Root of the storage prefix inside `store`.
    pub root: Path,
    pub cancel: CancellationToken,
    pub metrics: MetricsHandle,
}

impl PipelineContext {
    /// Opens the object store named by the storage settings.
    pub fn new(settings: Settings, cancel: CancellationToken) -> Result<Self> {
        let (store, root) = settings
            .storage
            .location
            .build(&settings.storage.options)?;
        Ok(Self::with_store(settings, store, root, cancel))
    }

    pub fn with_store(
        settings: Settings,
        store: Arc<dyn ObjectStore>,
        root: Path,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            root,
            cancel,
            metrics: MetricsHandle::global(),
        }
    }
}

/// Outcome of every chain, in registry order.
#[derive(Debug)]
pub struct PipelineReport {
    pub chains: Vec<ChainReport>,
}

impl PipelineReport {
    /// False if any chain failed.
    pub fn is_success(&self) -> bool {
        self.chains
            .iter()
            .all(|chain| chain.final_state != ChainState::Failed)
    }

    pub fn chain(&self, stream: &str) -> Option<&ChainReport> {
        self.chains.iter().find(|chain| chain.stream == stream)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for chain in &self.chains {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{chain}")?;
        }
        Ok(())
    }
}

/// Runs one [`StreamChain`] per configured stream, all sharing a single [`SourceFactory`].
pub struct Pipeline<F> {
    ctx: PipelineContext,
    factory: Arc<F>,
}

impl<F: SourceFactory> Pipeline<F> {
    pub fn new(ctx: PipelineContext, factory: F) -> Self {
        Self {
            ctx,
            factory: Arc::new(factory),
        }
    }

    /// Runs every chain to completion, that is until the context is cancelled or the chain fails.
    /// A failed chain does not stop the others.
    pub async fn run(self) -> PipelineReport {
        let mut states = Vec::with_capacity(self.ctx.settings.streams.len());
        let mut chains: Vec<(&'static str, JoinHandle<ChainReport>)> =
            Vec::with_capacity(self.ctx.settings.streams.len());
        for stream in &self.ctx.settings.streams {
            let chain = StreamChain::new(self.ctx.clone(), stream.clone(), Arc::clone(&self.factory));
            states.push(chain.state());
            chains.push((stream.definition.name, tokio::spawn(chain.run())));
        }
        info!(chains = chains.len(), "Started stream chains");

        // the server outlives the chains only until they are all done
        let server_cancel = self.ctx.cancel.child_token();
        let server = self.ctx.settings.metrics_port.map(|port| {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tokio::spawn(start_metrics_server(
                addr,
                Readiness::new(states),
                server_cancel.clone(),
            ))
        });

        let mut reports = Vec::with_capacity(chains.len());
        for (stream, handle) in chains {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(stream, ?e, "Chain task did not complete");
                    reports.push(ChainReport::aborted(stream));
                }
            }
        }

        server_cancel.cancel();
        if let Some(server) = server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(?e, "Metrics server failed"),
                Err(e) => error!(?e, "Metrics server task did not complete"),
            }
        }

        PipelineReport { chains: reports }
    }
}

/// Ingests every stream from Kafka until SIGINT or SIGTERM.
pub async fn ingest(settings: Settings) -> Result<PipelineReport> {
    let cln_token = CancellationToken::new();
    let factory = KafkaSourceFactory::new(
        settings.kafka.clone(),
        settings.read_batch_size,
        settings.read_timeout,
    );
    let ctx = PipelineContext::new(settings, cln_token.clone())?;

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_cln_token = cln_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let report = Pipeline::new(ctx, factory).run().await;

    // every chain failed on its own, nobody is waiting for a signal anymore
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    info!(%report, "Gracefully Exiting...");
    Ok(report)
}

/// Resolves on the first SIGINT or SIGTERM. A handler that cannot be installed never resolves.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
