//! Internal events shared by the producer, the transport and the engine.
//!
//! Each struct is one measurable occurrence. Engine-specific events live in
//! `verdant-bronze` and implement the same trait.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// A retry was scheduled after a transient failure.
pub struct RetryAttempted {
    pub operation: String,
}

impl InternalEvent for RetryAttempted {
    fn emit(self) {
        trace!(operation = %self.operation, "Retry attempted");
        counter!("verdant_retries_total", "operation" => self.operation).increment(1);
    }
}

/// A device type's schema was registered (or found already registered).
pub struct SchemaRegistered {
    pub device_type: String,
    /// False when an identical schema was already current.
    pub created: bool,
}

impl InternalEvent for SchemaRegistered {
    fn emit(self) {
        let outcome = if self.created { "created" } else { "existing" };
        trace!(device_type = %self.device_type, outcome, "Schema registered");
        counter!(
            "verdant_schema_registrations_total",
            "device_type" => self.device_type,
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// A schema lookup completed.
pub struct SchemaResolved {
    pub device_type: String,
    pub cache_hit: bool,
}

impl InternalEvent for SchemaResolved {
    fn emit(self) {
        let source = if self.cache_hit { "cache" } else { "registry" };
        trace!(device_type = %self.device_type, source, "Schema resolved");
        counter!(
            "verdant_schema_resolutions_total",
            "device_type" => self.device_type,
            "source" => source
        )
        .increment(1);
    }
}

/// A newer schema version replaced the cached one.
pub struct SchemaCacheInvalidated {
    pub device_type: String,
}

impl InternalEvent for SchemaCacheInvalidated {
    fn emit(self) {
        trace!(device_type = %self.device_type, "Schema cache invalidated");
        counter!("verdant_schema_cache_invalidations_total", "device_type" => self.device_type)
            .increment(1);
    }
}

/// Why `emit` refused a reading.
#[derive(Debug, Clone, Copy)]
pub enum RejectReason {
    SchemaMismatch,
    UnknownSchema,
    QueueFull,
    Closed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SchemaMismatch => "schema_mismatch",
            RejectReason::UnknownSchema => "unknown_schema",
            RejectReason::QueueFull => "queue_full",
            RejectReason::Closed => "closed",
        }
    }
}

/// A reading was rejected synchronously by the producer.
pub struct ReadingRejected {
    pub reason: RejectReason,
    pub device_type: String,
}

impl InternalEvent for ReadingRejected {
    fn emit(self) {
        trace!(reason = self.reason.as_str(), device_type = %self.device_type, "Reading rejected");
        counter!(
            "verdant_readings_rejected_total",
            "reason" => self.reason.as_str(),
            "device_type" => self.device_type
        )
        .increment(1);
    }
}

/// A message was acknowledged by the transport.
pub struct MessageDelivered {
    pub topic: String,
    pub attempts: u32,
}

impl InternalEvent for MessageDelivered {
    fn emit(self) {
        trace!(topic = %self.topic, attempts = self.attempts, "Message delivered");
        counter!("verdant_messages_delivered_total", "topic" => self.topic.clone()).increment(1);
        histogram!("verdant_delivery_attempts", "topic" => self.topic).record(self.attempts as f64);
    }
}

/// A message's delivery failed permanently or exhausted its retries.
pub struct DeliveryFailed {
    pub topic: String,
}

impl InternalEvent for DeliveryFailed {
    fn emit(self) {
        trace!(topic = %self.topic, "Delivery failed");
        counter!("verdant_delivery_failures_total", "topic" => self.topic).increment(1);
    }
}

/// Messages accepted by `emit` but not yet resolved.
pub struct InFlightMessages {
    pub count: usize,
    pub topic: String,
}

impl InternalEvent for InFlightMessages {
    fn emit(self) {
        trace!(count = self.count, topic = %self.topic, "In-flight messages");
        gauge!("verdant_in_flight_messages", "topic" => self.topic).set(self.count as f64);
    }
}

/// A retried send matched a record already in the log.
pub struct DuplicateSuppressed {
    pub topic: String,
}

impl InternalEvent for DuplicateSuppressed {
    fn emit(self) {
        trace!(topic = %self.topic, "Duplicate send suppressed");
        counter!("verdant_duplicates_suppressed_total", "topic" => self.topic).increment(1);
    }
}

/// Result of provisioning one topic.
pub struct TopicProvisioned {
    pub topic: String,
    pub outcome: &'static str,
}

impl InternalEvent for TopicProvisioned {
    fn emit(self) {
        trace!(topic = %self.topic, outcome = self.outcome, "Topic provisioned");
        counter!(
            "verdant_topics_provisioned_total",
            "topic" => self.topic,
            "outcome" => self.outcome
        )
        .increment(1);
    }
}

/// Readings generated by the simulator.
pub struct ReadingsSimulated {
    pub count: u64,
    pub device_type: String,
}

impl InternalEvent for ReadingsSimulated {
    fn emit(self) {
        trace!(count = self.count, device_type = %self.device_type, "Readings simulated");
        counter!("verdant_readings_simulated_total", "device_type" => self.device_type)
            .increment(self.count);
    }
}

/// Type of storage operation.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    PutIfAbsent,
    List,
    Delete,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::PutIfAbsent => "put_if_absent",
            StorageOperation::List => "list",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    NotFound,
    Conflict,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::NotFound => "not_found",
            RequestStatus::Conflict => "conflict",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis() as u64,
            "Storage request"
        );
        counter!(
            "verdant_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "verdant_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Outcome of a polling iteration.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
    Aborted,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
            IterationResultType::Aborted => "aborted",
        }
    }
}

/// Event emitted when a polling iteration completes.
pub struct IterationCompleted {
    pub service: &'static str,
    pub result: IterationResultType,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(
            service = self.service,
            result = self.result.as_str(),
            target = %self.target,
            "Iteration completed"
        );
        counter!(
            "verdant_polling_iterations_total",
            "service" => self.service,
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Wall-clock duration of one polling iteration.
pub struct IterationDuration {
    pub service: &'static str,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        trace!(
            service = self.service,
            duration_ms = self.duration.as_millis() as u64,
            target = %self.target,
            "Iteration duration"
        );
        histogram!(
            "verdant_polling_iteration_duration_seconds",
            "service" => self.service,
            "target" => self.target
        )
        .record(self.duration.as_secs_f64());
    }
}
