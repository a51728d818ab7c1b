//! verdant-bronze: streaming ingestion of sensor telemetry into a Delta Lake table.
//!
//! This crate handles:
//! - Consuming the telemetry topic in bounded micro-batches
//! - Resolving each record's schema from its envelope header, with bounded stalls
//! - Watermarked tumbling and sliding window aggregation per device type
//! - Committing aggregates and offsets atomically to Delta Lake

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod sink;
pub mod window;

// Re-export commonly used items
pub use checkpoint::EngineCheckpoint;
pub use config::{EngineConfig, MetricFunction, MetricSpec};
pub use engine::IngestionEngine;
pub use error::{EngineError, SinkError};
pub use sink::{AggregateSink, DeltaAggregateSink, MemorySink};
pub use window::{WindowAggregate, WindowSpec};
