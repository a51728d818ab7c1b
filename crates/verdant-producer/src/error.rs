//! Error types for the telemetry producer.

use snafu::prelude::*;

pub use verdant_core::error::{EnvelopeError, SchemaError, SchemaMismatch, TransportError};

/// Errors returned synchronously by the producer.
///
/// Send failures are never returned here; they arrive as a failed
/// [`DeliveryReceipt`](crate::DeliveryReceipt).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProducerError {
    /// A configured device type could not be registered or resolved.
    #[snafu(display("Failed to initialize schema for device type '{device_type}': {source}"))]
    Startup {
        device_type: String,
        source: SchemaError,
    },

    /// The target topic could not be inspected.
    #[snafu(display("Topic '{topic}' is unavailable: {source}"))]
    TopicUnavailable {
        topic: String,
        source: TransportError,
    },

    /// The reading's fields do not match its schema.
    #[snafu(display("Rejected reading: {source}"))]
    SchemaMismatch { source: SchemaMismatch },

    /// The producer was not configured for this device type.
    #[snafu(display("Device type '{device_type}' is not configured on this producer"))]
    UnknownDeviceType { device_type: String },

    /// The reading names a schema id other than the producer's current one.
    #[snafu(display(
        "Reading for '{device_type}' carries schema {schema_id}, expected {expected}"
    ))]
    UnregisteredSchema {
        device_type: String,
        schema_id: u32,
        expected: u32,
    },

    /// The payload could not be serialized.
    #[snafu(display("Failed to encode reading: {source}"))]
    Encode { source: EnvelopeError },

    /// The send queue is full; the caller may drop or retry later.
    #[snafu(display("Send queue is full ({capacity} messages)"))]
    QueueFull { capacity: usize },

    /// The producer has been closed.
    #[snafu(display("Producer is closed"))]
    Closed,

    /// Outstanding sends did not resolve before the flush deadline.
    #[snafu(display("Flush timed out with {pending} message(s) outstanding"))]
    FlushTimeout { pending: usize },
}
