//! verdant-producer: schema-aware telemetry producer.
//!
//! This crate handles:
//! - Registering the schema of every configured device type at startup
//! - Validating readings against their schema and encoding tagged envelopes
//! - Idempotent, retried delivery on a background task with receipts
//! - Simulating agricultural sensors for demos and load

pub mod config;
pub mod error;
pub mod producer;
pub mod simulator;

// Re-export commonly used items
pub use config::{ProducerConfig, SimulatorConfig};
pub use error::ProducerError;
pub use producer::{
    Accepted, DeliveryCallback, DeliveryOutcome, DeliveryReceipt, LoggingCallback,
    TelemetryProducer,
};
pub use simulator::{Simulator, SimulatorStats};
