use std::sync::Arc;

use backoff::retry::Retry;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RetrySettings;
use crate::message::{OffsetRange, TypedRecord};
use crate::schema::StreamDefinition;
use crate::store::{StreamPaths, parse_part_name};
use crate::{Error, Result};

/// Parquet encoding of record batches.
pub(crate) mod parquet;

/// Outcome of an [`SinkWriter::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResult {
    pub records_written: usize,
    /// Records at or below the offset already persisted by an earlier run.
    pub duplicates_skipped: usize,
    /// The part object written, None when nothing was left to write.
    pub object: Option<Path>,
    pub bytes_written: usize,
    /// Last offset of the appended range; the checkpoint may advance past it.
    pub through_offset: i64,
}

/// A message that failed to decode, kept in the stream's dead-letter area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reject {
    pub offset: i64,
    pub reason: String,
    /// The payload, lossily converted to UTF-8.
    pub payload: String,
}

/// Writes the admitted records of one stream as immutable Parquet parts. Part names carry the
/// offset range they hold, so re-appending a range after a crash overwrites the same object and
/// records already persisted are never written twice.
pub struct SinkWriter {
    store: Arc<dyn ObjectStore>,
    definition: &'static StreamDefinition,
    paths: StreamPaths,
    /// Highest offset held by an existing data part.
    written_through: Option<i64>,
    /// Highest offset held by an existing dead-letter part.
    rejected_through: Option<i64>,
    retry: RetrySettings,
}

impl SinkWriter {
    /// Creates the writer, recovering the highest persisted offsets from the parts already in the
    /// store.
    pub async fn recover(
        store: Arc<dyn ObjectStore>,
        root: &Path,
        definition: &'static StreamDefinition,
    ) -> Result<Self> {
        let paths = StreamPaths::new(root, definition.name);
        let written_through = highest_part_offset(store.as_ref(), paths.data_dir()).await?;
        let rejected_through = highest_part_offset(store.as_ref(), paths.errors_dir()).await?;
        info!(
            stream = definition.name,
            ?written_through,
            ?rejected_through,
            "Recovered sink"
        );
        Ok(Self {
            store,
            definition,
            paths,
            written_through,
            rejected_through,
            retry: RetrySettings::default(),
        })
    }

    /// Backoff applied to every put of a part.
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn written_through(&self) -> Option<i64> {
        self.written_through
    }

    /// Persists the records of a polled range. Durable once this returns Ok.
    pub async fn append(
        &mut self,
        batch: Vec<TypedRecord>,
        range: OffsetRange,
    ) -> Result<CommitResult> {
        let total = batch.len();
        let fresh: Vec<TypedRecord> = match self.written_through {
            Some(through) => batch.into_iter().filter(|r| r.offset > through).collect(),
            None => batch,
        };
        let duplicates_skipped = total - fresh.len();
        if duplicates_skipped > 0 {
            info!(
                stream = self.definition.name,
                duplicates_skipped,
                written_through = ?self.written_through,
                "Skipping records persisted by an earlier run"
            );
        }

        let Some(part_range) = unwritten(range, self.written_through).filter(|_| !fresh.is_empty())
        else {
            return Ok(CommitResult {
                records_written: 0,
                duplicates_skipped,
                object: None,
                bytes_written: 0,
                through_offset: range.last,
            });
        };

        let body = parquet::encode(self.definition, &fresh)?;
        let bytes_written = body.len();
        let object = self.paths.data_part(part_range);
        self.put(&object, body).await?;
        self.written_through = Some(part_range.last);

        debug!(
            stream = self.definition.name,
            %object,
            records = fresh.len(),
            bytes_written,
            "Wrote part"
        );
        Ok(CommitResult {
            records_written: fresh.len(),
            duplicates_skipped,
            object: Some(object),
            bytes_written,
            through_offset: range.last,
        })
    }

    /// Writes decode failures of a polled range as JSON lines.
    pub async fn append_rejects(
        &mut self,
        rejects: &[Reject],
        range: OffsetRange,
    ) -> Result<Option<Path>> {
        let fresh: Vec<&Reject> = rejects
            .iter()
            .filter(|r| self.rejected_through.is_none_or(|through| r.offset > through))
            .collect();
        let Some(part_range) = unwritten(range, self.rejected_through).filter(|_| !fresh.is_empty())
        else {
            return Ok(None);
        };

        let mut body = Vec::new();
        for reject in fresh {
            serde_json::to_writer(&mut body, reject)?;
            body.push(b'\n');
        }
        let object = self.paths.error_part(part_range);
        self.put(&object, Bytes::from(body)).await?;
        self.rejected_through = Some(part_range.last);
        Ok(Some(object))
    }

    /// Puts the part, retrying failed puts. Overwriting a part with the same range is harmless.
    async fn put(&self, object: &Path, body: Bytes) -> Result<()> {
        let store = self.store.as_ref();
        let payload = PutPayload::from(body);
        Retry::new(
            self.retry.backoff(),
            move || {
                let payload = payload.clone();
                async move {
                    store
                        .put(object, payload)
                        .await
                        .map(|_| ())
                        .map_err(|e| Error::SinkWrite(format!("Writing {object}: {e}")))
                }
            },
            |e: &Error| e.is_retryable(),
        )
        .await
    }
}

/// The part of `range` past `through`, None when all of it is already persisted.
fn unwritten(range: OffsetRange, through: Option<i64>) -> Option<OffsetRange> {
    let first = match through {
        Some(through) => range.first.max(through + 1),
        None => range.first,
    };
    (first <= range.last).then_some(OffsetRange::new(first, range.last))
}

async fn highest_part_offset(store: &dyn ObjectStore, dir: &Path) -> Result<Option<i64>> {
    let objects: Vec<_> = store
        .list(Some(dir))
        .try_collect()
        .await
        .map_err(|e| Error::SinkWrite(format!("Listing {dir}: {e}")))?;
    Ok(objects
        .iter()
        .filter_map(|meta| meta.location.filename().and_then(parse_part_name))
        .map(|range| range.last)
        .max())
}
