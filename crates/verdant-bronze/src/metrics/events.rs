//! Internal events for ingestion engine metrics.
//!
//! Every event carries the engine name as its `target` label so several
//! engines in one process stay distinguishable.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

pub use verdant_core::metrics::events::InternalEvent;

/// Records pulled from the transport for one batch.
pub struct RecordsFetched {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsFetched {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records fetched");
        counter!("verdant_engine_records_fetched_total", "target" => self.target)
            .increment(self.count);
    }
}

/// Where a record failed to decode.
#[derive(Debug, Clone, Copy)]
pub enum DecodeStage {
    Header,
    Payload,
}

impl DecodeStage {
    fn as_str(&self) -> &'static str {
        match self {
            DecodeStage::Header => "header",
            DecodeStage::Payload => "payload",
        }
    }
}

/// Records dropped because they did not decode.
pub struct DecodeFailed {
    pub stage: DecodeStage,
    pub count: u64,
    pub target: String,
}

impl InternalEvent for DecodeFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), count = self.count, "Decode failed");
        counter!(
            "verdant_engine_decode_errors_total",
            "stage" => self.stage.as_str(),
            "target" => self.target
        )
        .increment(self.count);
    }
}

/// Records dropped for arriving behind the watermark.
pub struct LateRecordsDropped {
    pub device_type: String,
    pub count: u64,
}

impl InternalEvent for LateRecordsDropped {
    fn emit(self) {
        trace!(device_type = %self.device_type, count = self.count, "Late records dropped");
        counter!(
            "verdant_engine_late_records_dropped_total",
            "device_type" => self.device_type
        )
        .increment(self.count);
    }
}

/// Records left for a later batch behind a stalled schema.
pub struct RecordsDeferred {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for RecordsDeferred {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Records deferred");
        counter!("verdant_engine_records_deferred_total", "target" => self.target)
            .increment(self.count);
    }
}

/// A schema id failed to resolve and holds back its partitions.
pub struct SchemaStalled {
    pub schema_id: u32,
    pub consecutive: u32,
}

impl InternalEvent for SchemaStalled {
    fn emit(self) {
        trace!(schema_id = self.schema_id, consecutive = self.consecutive, "Schema stalled");
        counter!("verdant_engine_schema_stalls_total").increment(1);
    }
}

/// A stalled schema ran out of batches; its records were dropped.
pub struct SchemaStallExhausted {
    pub schema_id: u32,
    pub dropped: u64,
}

impl InternalEvent for SchemaStallExhausted {
    fn emit(self) {
        trace!(schema_id = self.schema_id, dropped = self.dropped, "Schema stall exhausted");
        counter!("verdant_engine_schema_stall_exhausted_total").increment(1);
        counter!("verdant_engine_records_dropped_unresolved_total").increment(self.dropped);
    }
}

/// Finalized windows written for a device type.
pub struct AggregatesEmitted {
    pub device_type: String,
    pub count: u64,
}

impl InternalEvent for AggregatesEmitted {
    fn emit(self) {
        trace!(device_type = %self.device_type, count = self.count, "Aggregates emitted");
        counter!(
            "verdant_engine_aggregates_emitted_total",
            "device_type" => self.device_type
        )
        .increment(self.count);
    }
}

/// A batch committed.
pub struct BatchCommitted {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for BatchCommitted {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis() as u64, target = %self.target, "Batch committed");
        counter!("verdant_engine_batches_committed_total", "target" => self.target.clone())
            .increment(1);
        histogram!("verdant_engine_batch_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// A batch was rolled back.
pub struct BatchAborted {
    pub target: String,
}

impl InternalEvent for BatchAborted {
    fn emit(self) {
        trace!(target = %self.target, "Batch aborted");
        counter!("verdant_engine_batches_aborted_total", "target" => self.target).increment(1);
    }
}

/// Committed offset of a partition.
pub struct CommittedOffset {
    pub partition: u32,
    pub offset: u64,
}

impl InternalEvent for CommittedOffset {
    fn emit(self) {
        gauge!("verdant_engine_committed_offset", "partition" => self.partition.to_string())
            .set(self.offset as f64);
    }
}

/// Current event-time watermark, epoch milliseconds.
pub struct WatermarkAdvanced {
    pub watermark_ms: i64,
}

impl InternalEvent for WatermarkAdvanced {
    fn emit(self) {
        gauge!("verdant_engine_watermark_ms").set(self.watermark_ms as f64);
    }
}

/// Windows still waiting for the watermark.
pub struct OpenWindows {
    pub count: usize,
}

impl InternalEvent for OpenWindows {
    fn emit(self) {
        gauge!("verdant_engine_open_windows").set(self.count as f64);
    }
}

/// A Delta Lake commit completed.
pub struct DeltaCommitCompleted {
    pub duration: Duration,
    pub files: usize,
    pub table: String,
}

impl InternalEvent for DeltaCommitCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis() as u64,
            files = self.files,
            table = %self.table,
            "Delta commit completed"
        );
        histogram!("verdant_delta_commit_duration_seconds", "table" => self.table.clone())
            .record(self.duration.as_secs_f64());
        counter!("verdant_delta_files_committed_total", "table" => self.table)
            .increment(self.files as u64);
    }
}

/// Size of the checkpoint written with a commit.
pub struct CheckpointStateSize {
    pub bytes: usize,
}

impl InternalEvent for CheckpointStateSize {
    fn emit(self) {
        gauge!("verdant_checkpoint_state_size_bytes").set(self.bytes as f64);
    }
}
