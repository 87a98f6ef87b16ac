//! Per stream progress marker, persisted as a single JSON object next to the data it describes.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::StreamPaths;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream: String,
    /// The first offset not yet committed. A batch of offsets 100..=109 commits 110.
    pub last_committed_offset: i64,
    /// Storage prefix the committed data was written under.
    pub sink_path_prefix: String,
    /// Maximum event time admitted so far, restores the watermark on restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_event_time: Option<DateTime<Utc>>,
    pub committed_at: DateTime<Utc>,
}

/// Reads and overwrites the checkpoint object of each stream. Every stream has a single writer,
/// its chain.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    root: Path,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { store, root }
    }

    fn path(&self, stream: &str) -> Path {
        StreamPaths::new(&self.root, stream).checkpoint().clone()
    }

    /// The last committed checkpoint of the stream, None if it never committed.
    pub async fn load(&self, stream: &str) -> Result<Option<Checkpoint>> {
        let path = self.path(stream);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| Error::Checkpoint(format!("Reading {path}: {e}")))?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!(stream, %path, "No checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(Error::Checkpoint(format!("Fetching {path}: {e}"))),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Serialization(format!("Parsing checkpoint {path}: {e}")))?;
        if checkpoint.stream != stream {
            return Err(Error::Serialization(format!(
                "Checkpoint {path} belongs to stream {}",
                checkpoint.stream
            )));
        }
        info!(
            stream,
            offset = checkpoint.last_committed_offset,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Overwrites the checkpoint with a single put. Call only once the data it covers is durable.
    pub async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path(&checkpoint.stream);
        let body = serde_json::to_vec_pretty(checkpoint)?;
        self.store
            .put(&path, PutPayload::from(Bytes::from(body)))
            .await
            .map_err(|e| Error::Checkpoint(format!("Writing {path}: {e}")))?;
        debug!(
            stream = %checkpoint.stream,
            offset = checkpoint.last_committed_offset,
            "Committed checkpoint"
        );
        Ok(())
    }
}
