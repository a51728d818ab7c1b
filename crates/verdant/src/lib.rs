//! verdant: the sensor telemetry pipeline binary.
//!
//! One configuration file, four subcommands:
//! - `provision` creates the transport topics
//! - `simulate` publishes simulated farm readings
//! - `ingest` aggregates the telemetry topic into the bronze table
//! - `run` does all three in one process

pub mod commands;
pub mod config;
pub mod error;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::info;

use verdant_core::{cancel_on_signal, init_metrics};

pub use config::AppConfig;
pub use error::AppError;

use error::{AddressParseSnafu, MetricsSnafu};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Create the configured topics and exit
    Provision,
    /// Publish simulated sensor readings until interrupted
    Simulate,
    /// Aggregate the telemetry topic into the bronze table until interrupted
    Ingest,
    /// Provision, simulate and ingest in one process
    Run,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Provision => "provision",
            Command::Simulate => "simulate",
            Command::Ingest => "ingest",
            Command::Run => "run",
        }
    }
}

/// Run `command` to completion.
///
/// Long-running commands serve metrics and stop on the first shutdown
/// signal. The metrics server is stopped last.
pub async fn execute(command: Command, config: &AppConfig) -> Result<(), AppError> {
    if command == Command::Provision {
        return commands::provision(config).await;
    }

    let addr: SocketAddr = config
        .metrics
        .address
        .parse()
        .context(AddressParseSnafu {
            address: &config.metrics.address,
        })?;
    let metrics_shutdown = CancellationToken::new();
    init_metrics(addr, metrics_shutdown.clone()).context(MetricsSnafu)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = match command {
        Command::Provision => commands::provision(config).await,
        Command::Simulate => commands::simulate(config, shutdown.clone())
            .await
            .map(|stats| info!(emitted = stats.emitted, "Simulation finished")),
        Command::Ingest => commands::ingest(config, shutdown.clone()).await,
        Command::Run => commands::run_all(config, shutdown.clone())
            .await
            .map(|stats| info!(emitted = stats.emitted, "Pipeline finished")),
    };

    shutdown.cancel();
    metrics_shutdown.cancel();
    result
}
