//! Aggregate sinks.
//!
//! A sink commits a batch's finalized windows together with the engine
//! checkpoint as one atomic unit, and hands the latest committed checkpoint
//! back on recovery.

mod delta;
mod memory;

pub use delta::{DeltaAggregateSink, PARTITION_COLUMNS, table_schema};
pub use memory::MemorySink;

use async_trait::async_trait;

use crate::checkpoint::EngineCheckpoint;
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::window::WindowAggregate;

/// Transactional destination of window aggregates.
#[async_trait]
pub trait AggregateSink: Send + Sync {
    /// Commit `aggregates` and `checkpoint` atomically.
    ///
    /// Either both become visible or neither does. Returns the sink version
    /// of the commit.
    async fn commit(
        &mut self,
        aggregates: &[WindowAggregate],
        checkpoint: &EngineCheckpoint,
    ) -> Result<i64, SinkError>;

    /// The checkpoint of the most recent commit, if any.
    async fn recover_checkpoint(&mut self) -> Result<Option<EngineCheckpoint>, SinkError>;

    /// Sink identifier for logging.
    fn name(&self) -> &str;
}

/// Open the sink a configuration names: `memory://` gives an in-process
/// sink, anything else a Delta table.
pub async fn from_config(
    config: &SinkConfig,
    name: &str,
) -> Result<Box<dyn AggregateSink>, SinkError> {
    if config.table_uri.starts_with("memory://") {
        return Ok(Box::new(MemorySink::new(name)));
    }
    let sink = DeltaAggregateSink::open(config, name.to_string()).await?;
    Ok(Box::new(sink))
}
