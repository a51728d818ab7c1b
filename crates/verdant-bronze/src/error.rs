//! Error types for the ingestion engine.

use snafu::prelude::*;

pub use verdant_core::error::{SchemaError, StorageError, TransportError};

/// Errors from the aggregate sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// The table URI cannot back a Delta table.
    #[snafu(display("Unsupported table URI for a Delta sink: {uri}"))]
    UnsupportedUri { uri: String },

    /// Failed to parse Delta table URL.
    #[snafu(display("Failed to parse Delta table URL: {url}"))]
    UrlParse { url: String },

    /// Storage operation failed.
    #[snafu(display("Sink storage error: {source}"))]
    Storage { source: StorageError },

    /// Delta Lake operation failed.
    #[snafu(display("Delta Lake operation failed: {source}"))]
    DeltaOperation { source: deltalake::DeltaTableError },

    /// Failed to convert schema.
    #[snafu(display("Failed to convert schema: {source}"))]
    SchemaConversion {
        source: deltalake::arrow::error::ArrowError,
    },

    /// Failed to build the table schema.
    #[snafu(display("Failed to build table schema: {message}"))]
    StructType { message: String },

    /// Failed to build an Arrow record batch.
    #[snafu(display("Failed to build record batch: {source}"))]
    RecordBatch {
        source: deltalake::arrow::error::ArrowError,
    },

    /// Failed to write Parquet.
    #[snafu(display("Failed to write parquet: {source}"))]
    Parquet {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Failed to encode checkpoint JSON.
    #[snafu(display("Failed to encode checkpoint JSON: {source}"))]
    CheckpointJsonEncode { source: serde_json::Error },

    /// Failed to decode checkpoint JSON.
    #[snafu(display("Failed to decode checkpoint JSON: {source}"))]
    CheckpointJsonDecode { source: serde_json::Error },

    /// Checkpoint referenced by the table log is missing or malformed.
    #[snafu(display("Invalid checkpoint: {message}"))]
    InvalidCheckpoint { message: String },

    /// Simulated or external commit failure.
    #[snafu(display("Commit rejected: {message}"))]
    CommitRejected { message: String },
}

impl SinkError {
    /// Check if this error indicates the table does not exist.
    pub fn is_table_not_found(&self) -> bool {
        match self {
            SinkError::DeltaOperation { source } => {
                matches!(source, deltalake::DeltaTableError::NotATable(_))
            }
            _ => false,
        }
    }
}

/// Errors that stop the ingestion engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    /// Fetching from the transport failed after retries.
    #[snafu(display("Failed to fetch partition {partition} of '{topic}': {source}"))]
    Fetch {
        topic: String,
        partition: u32,
        source: TransportError,
    },

    /// The topic could not be inspected.
    #[snafu(display("Failed to inspect topic '{topic}': {source}"))]
    Topic {
        topic: String,
        source: TransportError,
    },

    /// The sink failed to commit or recover.
    #[snafu(display("Sink error: {source}"))]
    Sink { source: SinkError },

    /// An aggregation task panicked or was cancelled.
    #[snafu(display("Aggregation task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Too many batches aborted in a row.
    #[snafu(display("Engine stopped after {failures} consecutive failed batches: {last_error}"))]
    ConsecutiveFailures { failures: u32, last_error: String },
}

impl From<SinkError> for EngineError {
    fn from(source: SinkError) -> Self {
        EngineError::Sink { source }
    }
}
