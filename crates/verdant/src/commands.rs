//! The `verdant` subcommands.
//!
//! Each command opens what it needs from the configuration and runs
//! until done or until `shutdown` is cancelled.

use std::sync::Arc;

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use verdant_bronze::{EngineConfig, IngestionEngine, sink};
use verdant_core::config::RegistryKind;
use verdant_core::{ObjectLog, Registrar, ensure_topics, registry};
use verdant_producer::{LoggingCallback, Simulator, SimulatorStats, TelemetryProducer};

use crate::config::AppConfig;
use crate::error::{
    AppError, ConfigSnafu, EngineSnafu, ProducerSnafu, RegistrySnafu, SinkSnafu, TaskJoinSnafu,
    TransportSnafu,
};

/// Create every configured topic. Existing topics are left as they are.
pub async fn provision(config: &AppConfig) -> Result<(), AppError> {
    let log = open_log(config).await?;
    ensure_topics(
        log.as_ref(),
        &config.transport.topics,
        &config.provision_retry.policy(),
    )
    .await
    .context(TransportSnafu)?;
    info!(topics = config.transport.topics.len(), "Topics provisioned");
    Ok(())
}

/// Publish simulated readings until shutdown, then flush and close.
pub async fn simulate(
    config: &AppConfig,
    shutdown: CancellationToken,
) -> Result<SimulatorStats, AppError> {
    warn_if_process_local_registry(config, "simulate");
    let log = open_log(config).await?;
    let registrar = open_registrar(config)?;
    let producer = start_producer(config, registrar, log).await?;

    let stats = Simulator::new(Arc::clone(&producer), config.simulator.clone())
        .run(shutdown)
        .await;
    close_producer(&producer, config).await;
    Ok(stats)
}

/// Consume the telemetry topic into the aggregate table until shutdown.
pub async fn ingest(config: &AppConfig, shutdown: CancellationToken) -> Result<(), AppError> {
    let engine_config = config.engine().context(ConfigSnafu)?.clone();
    warn_if_process_local_registry(config, "ingest");
    let log = open_log(config).await?;
    let registrar = open_registrar(config)?;
    let engine = build_engine(engine_config, registrar, log).await?;
    engine.run(shutdown).await.context(EngineSnafu)
}

/// Provision, simulate and ingest in one process over one log and one
/// registry.
///
/// Shutdown stops the simulator and the engine's intake together. The
/// engine finishes its in-flight batch, then the producer is flushed and
/// closed. An engine that stops on its own (too many failed batches)
/// takes the simulator down with it.
pub async fn run_all(
    config: &AppConfig,
    shutdown: CancellationToken,
) -> Result<SimulatorStats, AppError> {
    let engine_config = config.engine().context(ConfigSnafu)?.clone();
    let log = open_log(config).await?;
    ensure_topics(
        log.as_ref(),
        &config.transport.topics,
        &config.provision_retry.policy(),
    )
    .await
    .context(TransportSnafu)?;

    let registrar = open_registrar(config)?;
    let producer = start_producer(config, Arc::clone(&registrar), Arc::clone(&log)).await?;
    let engine = build_engine(engine_config, registrar, log).await?;

    let mut engine_task = tokio::spawn(engine.run(shutdown.child_token()));

    let simulator = Simulator::new(Arc::clone(&producer), config.simulator.clone());
    let simulator_token = shutdown.child_token();
    let simulator_task = tokio::spawn(async move { simulator.run(simulator_token).await });

    let engine_exit = tokio::select! {
        joined = &mut engine_task => {
            warn!("Ingestion engine stopped, shutting down");
            shutdown.cancel();
            Some(joined)
        }
        _ = shutdown.cancelled() => None,
    };

    let stats = simulator_task
        .await
        .context(TaskJoinSnafu { task: "simulator" })?;
    let joined = match engine_exit {
        Some(joined) => joined,
        None => engine_task.await,
    };
    close_producer(&producer, config).await;

    joined
        .context(TaskJoinSnafu { task: "engine" })?
        .context(EngineSnafu)?;
    Ok(stats)
}

async fn open_log(config: &AppConfig) -> Result<Arc<ObjectLog>, AppError> {
    let log = ObjectLog::from_config(&config.transport)
        .await
        .context(TransportSnafu)?;
    Ok(Arc::new(log))
}

fn open_registrar(config: &AppConfig) -> Result<Arc<Registrar>, AppError> {
    let registry = registry::from_config(&config.registry).context(RegistrySnafu)?;
    Ok(Arc::new(Registrar::new(
        registry,
        config.registry.retry.policy(),
    )))
}

async fn start_producer(
    config: &AppConfig,
    registrar: Arc<Registrar>,
    log: Arc<ObjectLog>,
) -> Result<Arc<TelemetryProducer>, AppError> {
    let producer = TelemetryProducer::new(
        &config.producer,
        registrar,
        log,
        Arc::new(LoggingCallback),
    )
    .await
    .context(ProducerSnafu)?;
    Ok(Arc::new(producer))
}

async fn build_engine(
    config: EngineConfig,
    registrar: Arc<Registrar>,
    log: Arc<ObjectLog>,
) -> Result<IngestionEngine, AppError> {
    let sink = sink::from_config(&config.sink, &config.name)
        .await
        .context(SinkSnafu)?;
    Ok(IngestionEngine::new(config, registrar, log, sink))
}

async fn close_producer(producer: &TelemetryProducer, config: &AppConfig) {
    match producer.close(config.producer.flush_timeout()).await {
        Ok(()) => info!(topic = %producer.topic(), "Producer closed"),
        Err(e) => warn!(error = %e, "Producer closed with undelivered messages"),
    }
}

/// A process-local registry cannot be shared with another process.
fn warn_if_process_local_registry(config: &AppConfig, command: &str) {
    if config.registry.kind == RegistryKind::Memory {
        warn!(
            command,
            "Registry kind 'memory' is only visible inside this process; use 'run' or an http registry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn memory_config() -> AppConfig {
        AppConfig::parse(
            r#"
transport:
  url: memory://log
  topics:
    - name: raw-sensor-data
      partitions: 2
      replication_factor: 1
registry:
  kind: memory
producer:
  device_types:
    soil_moisture:
      moisture: float
    bird_feeder:
      food_level: float
      status: string
simulator:
  interval_secs: 1
  farm_count: 3
engine:
  batch:
    interval_ms: 50
  window:
    size_secs: 60
    slide_secs: 60
  metrics:
    soil_moisture:
      function: mean
      field: moisture
  sink:
    table_uri: memory://bronze
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_all_in_memory_until_shutdown() {
        let config = memory_config();
        let shutdown = CancellationToken::new();

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            stopper.cancel();
        });

        let stats = tokio::time::timeout(Duration::from_secs(30), run_all(&config, shutdown))
            .await
            .expect("run_all should stop after shutdown")
            .unwrap();

        assert!(stats.rounds >= 1);
        assert_eq!(stats.emitted, stats.rounds * 2);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_ingest_requires_engine_section() {
        let mut config = memory_config();
        config.engine = None;

        let err = ingest(&config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
    }

    #[tokio::test]
    async fn test_simulate_fails_without_topic() {
        // A fresh in-memory log has no topics until provisioned.
        let config = memory_config();
        let err = simulate(&config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Producer { .. }));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut config = memory_config();
        config.transport.url = format!("file://{}", dir.path().display());

        provision(&config).await.unwrap();
        provision(&config).await.unwrap();

        assert!(dir.path().join("raw-sensor-data").is_dir());
    }
}
