//! verdant CLI: provision topics, simulate sensors and ingest telemetry.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use verdant::{AppConfig, CliArgs, execute};
use verdant_core::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    info!(path = %args.config.display(), "Loading config");
    let config = match AppConfig::from_path(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match execute(args.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} failed: {e}", args.command.name());
            ExitCode::FAILURE
        }
    }
}
