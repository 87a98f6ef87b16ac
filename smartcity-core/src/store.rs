//! Object store handle and the path layout of everything the pipeline persists.
//!
//! ```text
//! <prefix>/data/<stream>/part-<first>-<last>.parquet
//! <prefix>/checkpoints/<stream>/checkpoint.json
//! <prefix>/errors/<stream>/part-<first>-<last>.jsonl
//! ```
//! Offsets in object names are zero padded to 20 digits so that the lexical order of a listing is
//! the offset order.

use std::path::PathBuf;
use std::sync::Arc;

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use tracing::info;
use url::Url;

use crate::message::OffsetRange;
use crate::{Error, Result};

const DATA_DIR: &str = "data";
const CHECKPOINT_DIR: &str = "checkpoints";
const ERRORS_DIR: &str = "errors";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const PART_PREFIX: &str = "part-";

/// Where the store lives, parsed from the configured storage prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageLocation {
    /// `memory://<root>`, process local. Used for tests and dry runs.
    Memory { root: String },
    /// `file:///dir` or a bare path.
    Local { dir: PathBuf },
    /// `s3://bucket/root`, `s3a://` is accepted as an alias.
    S3 { url: Url },
}

impl StorageLocation {
    pub fn parse(prefix: &str) -> Result<Self> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(Error::Config("storage prefix is empty".to_string()));
        }
        if !prefix.contains("://") {
            return Ok(StorageLocation::Local {
                dir: PathBuf::from(prefix),
            });
        }

        let url = Url::parse(prefix)
            .map_err(|e| Error::Config(format!("Invalid storage prefix {prefix:?}: {e}")))?;
        match url.scheme() {
            "memory" => Ok(StorageLocation::Memory {
                root: format!("{}{}", url.host_str().unwrap_or_default(), url.path()),
            }),
            "file" => Ok(StorageLocation::Local {
                dir: url.to_file_path().map_err(|_| {
                    Error::Config(format!("Storage prefix {prefix:?} is not an absolute path"))
                })?,
            }),
            "s3" => Ok(StorageLocation::S3 { url }),
            "s3a" => {
                let rewritten = format!("s3{}", prefix.trim_start_matches("s3a"));
                let url = Url::parse(&rewritten)
                    .map_err(|e| Error::Config(format!("Invalid storage prefix {prefix:?}: {e}")))?;
                Ok(StorageLocation::S3 { url })
            }
            other => Err(Error::Config(format!(
                "Unsupported storage scheme {other:?} in {prefix:?}, expected one of s3, s3a, file, memory"
            ))),
        }
    }

    /// Builds the object store and the root path inside it. `options` are passed to the S3
    /// builder (`aws_access_key_id`, `aws_region`, ...), ignored otherwise.
    pub fn build(&self, options: &[(String, String)]) -> Result<(Arc<dyn ObjectStore>, Path)> {
        match self {
            StorageLocation::Memory { root } => {
                Ok((Arc::new(InMemory::new()), Path::from(root.as_str())))
            }
            StorageLocation::Local { dir } => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    Error::Config(format!("Creating storage directory {}: {e}", dir.display()))
                })?;
                let store = LocalFileSystem::new_with_prefix(dir).map_err(|e| {
                    Error::Config(format!("Opening storage directory {}: {e}", dir.display()))
                })?;
                Ok((Arc::new(store), Path::default()))
            }
            StorageLocation::S3 { url } => {
                let (store, root) = object_store::parse_url_opts(url, options.iter().cloned())
                    .map_err(|e| Error::Config(format!("Building S3 store for {url}: {e}")))?;
                info!(%url, "Using S3 object store");
                Ok((Arc::from(store), root))
            }
        }
    }
}

/// Paths of one stream under the storage root.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPaths {
    data: Path,
    errors: Path,
    checkpoint: Path,
}

impl StreamPaths {
    pub fn new(root: &Path, stream: &str) -> Self {
        let under = |dir: &str| join(&join(root, dir), stream);
        Self {
            data: under(DATA_DIR),
            errors: under(ERRORS_DIR),
            checkpoint: join(&under(CHECKPOINT_DIR), CHECKPOINT_FILE),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn errors_dir(&self) -> &Path {
        &self.errors
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    pub fn data_part(&self, range: OffsetRange) -> Path {
        join(&self.data, &part_name(range, "parquet"))
    }

    pub fn error_part(&self, range: OffsetRange) -> Path {
        join(&self.errors, &part_name(range, "jsonl"))
    }
}

fn join(base: &Path, segment: &str) -> Path {
    if base.as_ref().is_empty() {
        Path::from(segment)
    } else {
        base.child(segment)
    }
}

fn part_name(range: OffsetRange, extension: &str) -> String {
    format!(
        "{PART_PREFIX}{:020}-{:020}.{extension}",
        range.first, range.last
    )
}

/// Recovers the offset range from a part object name, None for foreign objects.
pub fn parse_part_name(name: &str) -> Option<OffsetRange> {
    let stem = name.strip_prefix(PART_PREFIX)?;
    let (stem, _extension) = stem.rsplit_once('.')?;
    let (first, last) = stem.split_once('-')?;
    let range = OffsetRange::new(first.parse().ok()?, last.parse().ok()?);
    (range.first <= range.last).then_some(range)
}
