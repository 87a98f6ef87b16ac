//! Ingestion of the smart-city telemetry streams into columnar storage.
//!
//! Every stream of the [schema] registry gets its own chain, which in an infinite loop till a
//! shutdown signal is received:
//! - Polls a batch of raw messages from its bus topic
//! - Decodes each message against the stream definition
//! - Drops the records behind the watermark
//! - Appends the admitted records to the store as one Parquet part
//! - Commits the checkpoint of the batch
//!
//! The chains share nothing but the read-only settings, the object store and the metrics registry.

mod error;
pub use crate::error::{Error, Result};

/// Static definitions of the five streams.
pub mod schema;

pub mod message;

pub mod decoder;

pub mod watermark;

/// Where the bus messages come from.
pub mod source;

/// Durable output of every chain, one part per batch.
pub mod sink;

pub mod checkpoint;

pub mod store;

pub mod config;

pub mod metrics;

/// The coordinator of the per stream chains.
pub mod pipeline;
pub use crate::pipeline::ingest;
