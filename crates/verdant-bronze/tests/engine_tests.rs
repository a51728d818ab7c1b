//! Integration tests for the ingestion engine against an in-memory object
//! log, schema registry and sink.
//!
//! Run with: cargo test -p verdant-bronze --test engine_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;

use verdant_bronze::config::{EngineConfig, MetricFunction, MetricSpec, WindowConfig};
use verdant_bronze::error::EngineError;
use verdant_bronze::{IngestionEngine, MemorySink, WindowAggregate};
use verdant_core::config::RetryConfig;
use verdant_core::envelope::Envelope;
use verdant_core::error::RegistryError;
use verdant_core::polling::IterationResult;
use verdant_core::registrar::Registrar;
use verdant_core::registry::{MemorySchemaRegistry, RegisteredSchema, SchemaRegistry};
use verdant_core::retry::RetryPolicy;
use verdant_core::schema::{FieldValue, SchemaId};
use verdant_core::storage::StorageProvider;
use verdant_core::transport::{ObjectLog, ProduceRecord, TopicAdmin, TopicSpec, Transport};
use verdant_producer::{LoggingCallback, ProducerConfig, TelemetryProducer};

const TOPIC: &str = "raw-sensor-data";

/// Fails the next `failures` lookups by id, then delegates.
struct FlakyRegistry {
    inner: Arc<MemorySchemaRegistry>,
    failures: AtomicUsize,
}

#[async_trait]
impl SchemaRegistry for FlakyRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, RegistryError> {
        self.inner.register(subject, schema).await
    }

    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        self.inner.latest(subject).await
    }

    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(RegistryError::RegistryUnavailable {
                message: "registry restarting".into(),
            });
        }
        self.inner.by_id(id).await
    }
}

/// A producer and an engine sharing one log, registry and sink.
struct Fixture {
    log: Arc<ObjectLog>,
    registry: Arc<MemorySchemaRegistry>,
    producer: TelemetryProducer,
    sink: MemorySink,
}

impl Fixture {
    async fn new(partitions: u32) -> Self {
        let storage = StorageProvider::for_url("memory://engine-tests")
            .await
            .unwrap();
        let log = Arc::new(ObjectLog::new(Arc::new(storage)));
        log.create_topic(&TopicSpec::new(TOPIC, partitions, 1))
            .await
            .unwrap();

        let registry = Arc::new(MemorySchemaRegistry::new());
        let producer_registrar = Arc::new(Registrar::new(
            registry.clone(),
            RetryPolicy::new(1, Duration::ZERO),
        ));
        let producer_config = ProducerConfig {
            retry_backoff_ms: 0,
            retry_backoff_max_ms: 0,
            ..Default::default()
        };
        let producer = TelemetryProducer::new(
            &producer_config,
            producer_registrar,
            log.clone(),
            Arc::new(LoggingCallback),
        )
        .await
        .unwrap();

        Self {
            log,
            registry,
            producer,
            sink: MemorySink::with_history("bronze-test"),
        }
    }

    /// An engine with its own registrar over the shared registry.
    fn engine(&self, config: EngineConfig) -> IngestionEngine {
        self.engine_with_registry(config, self.registry.clone())
    }

    fn engine_with_registry(
        &self,
        config: EngineConfig,
        registry: Arc<dyn SchemaRegistry>,
    ) -> IngestionEngine {
        let registrar = Arc::new(Registrar::new(registry, RetryPolicy::new(1, Duration::ZERO)));
        IngestionEngine::new(
            config,
            registrar,
            self.log.clone(),
            Box::new(self.sink.clone()),
        )
    }

    async fn emit(&self, device_type: &str, source_id: &str, secs: i64, fields: &[(&str, f64)]) {
        let values: IndexMap<String, FieldValue> = fields
            .iter()
            .map(|(name, value)| (name.to_string(), FieldValue::from(*value)))
            .collect();
        let reading = self
            .producer
            .reading(device_type, source_id, at(secs), values)
            .unwrap();
        self.producer.emit(reading).unwrap();
        self.producer.flush(Duration::from_secs(5)).await.unwrap();
    }

    async fn soil(&self, source_id: &str, secs: i64, moisture: f64) {
        self.emit(
            "soil_moisture",
            source_id,
            secs,
            &[("moisture", moisture), ("ph", 6.5)],
        )
        .await;
    }

    /// Append a raw payload to partition 0, bypassing the producer.
    async fn append_raw(&self, sequence: u64, payload: Bytes) {
        self.log
            .send(
                TOPIC,
                &ProduceRecord {
                    partition: 0,
                    key: "raw".into(),
                    payload,
                    producer_id: 7,
                    sequence,
                    timestamp_ms: at(0).timestamp_millis(),
                },
            )
            .await
            .unwrap();
    }
}

/// Start of a window-aligned test hour plus `secs`.
fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// One-minute tumbling windows without lateness; no fetch retries.
fn engine_config() -> EngineConfig {
    EngineConfig {
        window: WindowConfig {
            size_secs: 60,
            slide_secs: 60,
            allowed_lateness_secs: 0,
        },
        fetch_retry: RetryConfig {
            max_attempts: 1,
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        },
        ..EngineConfig::new("memory://bronze")
    }
}

fn soil_mean_config() -> EngineConfig {
    let mut config = engine_config();
    config.metrics.insert(
        "soil_moisture".to_string(),
        MetricSpec::new(MetricFunction::Mean, "moisture"),
    );
    config
}

fn windows_of(aggregates: &[WindowAggregate], source_id: &str) -> Vec<DateTime<Utc>> {
    aggregates
        .iter()
        .filter(|a| a.source_id == source_id)
        .map(|a| a.window_start)
        .collect()
}

fn assert_offsets_monotonic(sink: &MemorySink) {
    let checkpoints = sink.checkpoints();
    for pair in checkpoints.windows(2) {
        assert!(pair[1].batch_id > pair[0].batch_id);
        for (partition, offset) in &pair[0].offsets {
            assert!(
                pair[1].offset(*partition) >= *offset,
                "offset of partition {partition} went backwards"
            );
        }
    }
}

/// Test: a registered soil_moisture reading appears as an aggregate once the
/// watermark passes the end of its window.
#[tokio::test]
async fn test_soil_moisture_window_is_emitted_after_watermark() {
    let fixture = Fixture::new(1).await;
    let mut engine = fixture.engine(soil_mean_config());

    fixture.soil("farm_1", 10, 42.0).await;
    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);
    assert!(fixture.sink.aggregates().is_empty());
    assert_eq!(engine.checkpoint().open_windows.len(), 1);

    fixture.soil("farm_2", 70, 30.0).await;
    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);

    let aggregates = fixture.sink.aggregates();
    assert_eq!(aggregates.len(), 1);
    let aggregate = &aggregates[0];
    assert_eq!(aggregate.source_id, "farm_1");
    assert_eq!(aggregate.device_type, "soil_moisture");
    assert_eq!(aggregate.window_start, at(0));
    assert_eq!(aggregate.window_end, at(60));
    assert_eq!(aggregate.metric, "mean(moisture)");
    assert_eq!(aggregate.metric_value, Some(42.0));
    assert_eq!(aggregate.record_count, 1);

    assert_eq!(engine.checkpoint().offset(0), 2);
    assert_eq!(engine.step().await.unwrap(), IterationResult::NoItems);
}

/// Test: a commit whose acknowledgement is lost is recovered, not replayed,
/// so its output appears exactly once and offsets never move backwards.
#[tokio::test]
async fn test_lost_commit_ack_is_recovered_without_double_output() {
    let fixture = Fixture::new(1).await;
    let mut engine = fixture.engine(engine_config());

    fixture.soil("farm_1", 10, 42.0).await;
    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);

    fixture.soil("farm_1", 75, 40.0).await;
    fixture.sink.lose_next_acks(1);
    assert_eq!(engine.step().await.unwrap(), IterationResult::Aborted);
    assert_eq!(engine.checkpoint().offset(0), 1);

    // The landed commit is read back before fetching again.
    assert_eq!(engine.step().await.unwrap(), IterationResult::NoItems);
    assert_eq!(engine.checkpoint().offset(0), 2);

    assert_eq!(fixture.sink.commit_count(), 2);
    assert_eq!(windows_of(&fixture.sink.aggregates(), "farm_1"), vec![at(0)]);
    assert_offsets_monotonic(&fixture.sink);
}

/// Test: a rejected commit followed by a crash resumes from the last
/// committed checkpoint, including its open windows.
#[tokio::test]
async fn test_crash_mid_batch_resumes_from_committed_state() {
    let fixture = Fixture::new(2).await;
    let mut engine = fixture.engine(engine_config());

    fixture.soil("farm_1", 5, 10.0).await;
    fixture.soil("farm_2", 15, 20.0).await;
    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);
    let committed = engine.checkpoint().clone();

    fixture.soil("farm_1", 65, 30.0).await;
    fixture.soil("farm_3", 80, 40.0).await;
    fixture.sink.reject_next_commits(1);
    assert_eq!(engine.step().await.unwrap(), IterationResult::Aborted);
    assert_eq!(engine.checkpoint(), &committed);
    drop(engine);

    let mut restarted = fixture.engine(engine_config());
    assert_eq!(restarted.step().await.unwrap(), IterationResult::ProcessedItems);

    let aggregates = fixture.sink.aggregates();
    assert_eq!(windows_of(&aggregates, "farm_1"), vec![at(0)]);
    assert_eq!(windows_of(&aggregates, "farm_2"), vec![at(0)]);
    assert!(windows_of(&aggregates, "farm_3").is_empty());
    assert_eq!(restarted.checkpoint().total_offset(), 4);
    assert_eq!(restarted.checkpoint().batch_id, 2);
    assert_offsets_monotonic(&fixture.sink);
}

/// Test: records behind the watermark at the start of their batch never
/// reach an aggregate.
#[tokio::test]
async fn test_late_records_are_dropped() {
    let fixture = Fixture::new(1).await;
    let mut engine = fixture.engine(engine_config());

    fixture.soil("farm_1", 120, 1.0).await;
    engine.step().await.unwrap();

    fixture.soil("farm_1", 10, 2.0).await;
    fixture.soil("farm_1", 130, 3.0).await;
    engine.step().await.unwrap();

    fixture.soil("farm_1", 200, 4.0).await;
    engine.step().await.unwrap();

    let aggregates = fixture.sink.aggregates();
    assert_eq!(windows_of(&aggregates, "farm_1"), vec![at(120)]);
    assert_eq!(aggregates[0].record_count, 2);
    assert_eq!(aggregates[0].metric, "count");
    assert_eq!(aggregates[0].metric_value, Some(2.0));
    assert_eq!(engine.checkpoint().offset(0), 4);
}

/// Test: an unknown schema id holds its partition back for the configured
/// number of batches, then its records are dropped and the rest proceed.
#[tokio::test]
async fn test_unresolved_schema_stalls_then_drops() {
    let fixture = Fixture::new(1).await;
    let config = EngineConfig {
        max_schema_stall_batches: 2,
        ..engine_config()
    };
    let mut engine = fixture.engine(config);

    let orphan = Envelope {
        schema_id: SchemaId(999),
        payload: Bytes::from_static(b"{\"source_id\":\"farm_9\",\"timestamp\":0}"),
    };
    fixture.append_raw(0, orphan.encode()).await;
    fixture.soil("farm_1", 10, 42.0).await;

    for consecutive in 1..=2 {
        assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);
        let checkpoint = engine.checkpoint();
        assert_eq!(checkpoint.offset(0), 0);
        assert_eq!(checkpoint.schema_stalls.get(&999), Some(&consecutive));
        assert!(checkpoint.open_windows.is_empty());
    }

    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);
    let checkpoint = engine.checkpoint();
    assert_eq!(checkpoint.offset(0), 2);
    assert_eq!(checkpoint.schema_stalls.get(&999), Some(&3));
    assert_eq!(checkpoint.open_windows.len(), 1);
    assert_eq!(checkpoint.open_windows[0].source_id, "farm_1");
}

/// Test: a transient registry outage stalls one batch and clears once the
/// schema resolves.
#[tokio::test]
async fn test_stall_clears_when_schema_resolves() {
    let fixture = Fixture::new(1).await;
    let flaky = Arc::new(FlakyRegistry {
        inner: fixture.registry.clone(),
        failures: AtomicUsize::new(1),
    });
    let mut engine = fixture.engine_with_registry(engine_config(), flaky);

    fixture.soil("farm_1", 10, 42.0).await;

    engine.step().await.unwrap();
    assert_eq!(engine.checkpoint().offset(0), 0);
    assert_eq!(engine.checkpoint().schema_stalls.len(), 1);

    engine.step().await.unwrap();
    assert_eq!(engine.checkpoint().offset(0), 1);
    assert!(engine.checkpoint().schema_stalls.is_empty());
    assert_eq!(engine.checkpoint().open_windows.len(), 1);
}

/// Test: records that do not decode are dropped while their offsets advance.
#[tokio::test]
async fn test_undecodable_records_are_dropped() {
    let fixture = Fixture::new(1).await;
    let mut engine = fixture.engine(engine_config());
    let soil_id = fixture
        .producer
        .schema("soil_moisture")
        .unwrap()
        .schema_id;

    fixture
        .append_raw(0, Bytes::from_static(&[0x07, 0x00]))
        .await;
    let missing_ph = Envelope {
        schema_id: soil_id,
        payload: Bytes::from_static(
            b"{\"source_id\":\"farm_1\",\"timestamp\":1714564810000,\"moisture\":1.0}",
        ),
    };
    fixture.append_raw(1, missing_ph.encode()).await;
    fixture.soil("farm_1", 10, 42.0).await;

    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);
    let checkpoint = engine.checkpoint();
    assert_eq!(checkpoint.offset(0), 3);
    assert_eq!(checkpoint.open_windows.len(), 1);
    assert_eq!(checkpoint.open_windows[0].accumulator.count, 1);
}

/// Test: device types are aggregated side by side with their own metrics.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_types_aggregate_in_parallel() {
    let fixture = Fixture::new(3).await;
    let mut config = soil_mean_config();
    config.metrics.insert(
        "poultry_temp".to_string(),
        MetricSpec::new(MetricFunction::Max, "temp_celsius"),
    );
    let mut engine = fixture.engine(config);

    for farm in ["farm_1", "farm_2"] {
        fixture.soil(farm, 10, 40.0).await;
        fixture
            .emit(
                "poultry_temp",
                farm,
                20,
                &[("temp_celsius", 21.5), ("humidity", 60.0)],
            )
            .await;
        fixture
            .emit(
                "bird_feeder",
                farm,
                30,
                &[("food_level", 80.0), ("battery", 90.0)],
            )
            .await;
    }
    fixture
        .emit(
            "poultry_temp",
            "farm_1",
            40,
            &[("temp_celsius", 25.0), ("humidity", 55.0)],
        )
        .await;
    fixture.soil("farm_3", 90, 10.0).await;

    assert_eq!(engine.step().await.unwrap(), IterationResult::ProcessedItems);

    let aggregates = fixture.sink.aggregates();
    let keys: Vec<(&str, &str)> = aggregates
        .iter()
        .map(|a| (a.device_type.as_str(), a.source_id.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("bird_feeder", "farm_1"),
            ("bird_feeder", "farm_2"),
            ("poultry_temp", "farm_1"),
            ("poultry_temp", "farm_2"),
            ("soil_moisture", "farm_1"),
            ("soil_moisture", "farm_2"),
        ]
    );

    let poultry_farm_1 = &aggregates[2];
    assert_eq!(poultry_farm_1.metric, "max(temp_celsius)");
    assert_eq!(poultry_farm_1.metric_value, Some(25.0));
    assert_eq!(poultry_farm_1.record_count, 2);
    assert_eq!(aggregates[0].metric, "count");
    assert_eq!(aggregates[4].metric_value, Some(40.0));

    let open = &engine.checkpoint().open_windows;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].source_id, "farm_3");
}

/// Test: the engine stops once the consecutive failure cap is reached.
#[tokio::test]
async fn test_consecutive_failures_stop_the_engine() {
    let fixture = Fixture::new(1).await;
    let config = EngineConfig {
        max_consecutive_failures: 2,
        ..engine_config()
    };
    let mut engine = fixture.engine(config);

    fixture.soil("farm_1", 10, 42.0).await;
    fixture.sink.reject_next_commits(5);

    assert_eq!(engine.step().await.unwrap(), IterationResult::Aborted);
    match engine.step().await {
        Err(EngineError::ConsecutiveFailures { failures, .. }) => assert_eq!(failures, 2),
        other => panic!("expected the engine to stop, got {other:?}"),
    }
    assert_eq!(fixture.sink.commit_count(), 0);
}

/// Test: sliding windows emit one aggregate per overlapping window.
#[tokio::test]
async fn test_sliding_windows_overlap() {
    let fixture = Fixture::new(1).await;
    let config = EngineConfig {
        window: WindowConfig {
            size_secs: 60,
            slide_secs: 30,
            allowed_lateness_secs: 0,
        },
        ..engine_config()
    };
    let mut engine = fixture.engine(config);

    fixture.soil("farm_1", 45, 1.0).await;
    fixture.soil("farm_2", 200, 1.0).await;
    engine.step().await.unwrap();

    assert_eq!(
        windows_of(&fixture.sink.aggregates(), "farm_1"),
        vec![at(0), at(30)]
    );
}
