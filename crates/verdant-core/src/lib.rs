//! verdant-core: shared components for the verdant telemetry pipeline.
//!
//! Used by the producer (`verdant-producer`), the ingestion engine
//! (`verdant-bronze`) and the `verdant` binary:
//!
//! - `schema/` - Device-type schemas, field types and the registry document format
//! - `registry/` - Schema registry clients (Confluent REST and in-process)
//! - `registrar` - Idempotent registration and cached resolution of schemas
//! - `envelope` - The tagged wire envelope
//! - `transport/` - Partitioned append-only log, topic administration and provisioning
//! - `storage/` - Object storage abstraction (S3/MinIO, local, memory)
//! - `metrics/` - Prometheus metrics infrastructure
//! - `config/` - Shared configuration types and environment variable interpolation
//! - `polling` - Generic polling loop trait and runner
//! - `retry` - Explicit retry policies
//! - `signal` - Signal handling for graceful shutdown
//! - `error` - Common error types

pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod registrar;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod signal;
pub mod storage;
pub mod tracing;
pub mod transport;

// Re-export commonly used items
pub use config::{MetricsConfig, RegistryConfig, RetryConfig, TransportConfig, load_yaml};
pub use envelope::{Envelope, Reading};
pub use error::{
    ConfigError, EnvelopeError, MetricsError, RegistryError, SchemaError, SchemaMismatch,
    StorageError, TransportError,
};
pub use metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use polling::{IterationResult, PollingProcessor, run_polling_loop};
pub use registrar::Registrar;
pub use registry::{HttpSchemaRegistry, MemorySchemaRegistry, SchemaRegistry};
pub use retry::{RetryError, RetryPolicy, retry_with_policy};
pub use schema::{FieldType, FieldValue, SchemaDefinition, SchemaId};
pub use signal::{cancel_on_signal, shutdown_signal};
pub use storage::{StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
pub use transport::{
    ConsumedRecord, ObjectLog, ProduceRecord, RecordPosition, TopicAdmin, TopicOutcome, TopicSpec,
    Transport, ensure_topics, partition_for,
};
