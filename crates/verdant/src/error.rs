//! Error types for the verdant binary.

use snafu::prelude::*;

use verdant_bronze::{EngineError, SinkError};
use verdant_core::error::{ConfigError, MetricsError, RegistryError, TransportError};
use verdant_producer::ProducerError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Invalid metrics address '{address}': {source}"))]
    AddressParse {
        address: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("Failed to start metrics server: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("Failed to connect to schema registry: {source}"))]
    Registry { source: RegistryError },

    #[snafu(display("Transport error: {source}"))]
    Transport { source: TransportError },

    #[snafu(display("Producer error: {source}"))]
    Producer { source: ProducerError },

    #[snafu(display("Failed to open aggregate sink: {source}"))]
    Sink { source: SinkError },

    #[snafu(display("Ingestion engine failed: {source}"))]
    Engine { source: EngineError },

    #[snafu(display("Task '{task}' panicked or was cancelled: {source}"))]
    TaskJoin {
        task: &'static str,
        source: tokio::task::JoinError,
    },
}
