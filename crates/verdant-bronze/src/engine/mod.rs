//! The streaming ingestion engine.
//!
//! Each micro-batch is fetched from the transport, grouped by the schema id
//! in the envelope header, decoded against the resolved schema, folded into
//! event-time windows and committed to the sink together with the advanced
//! checkpoint. Work happens on a copy of the checkpoint, so a batch that
//! fails anywhere before the commit leaves the committed state untouched and
//! is simply fetched again.

mod batch;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use verdant_core::emit;
use verdant_core::envelope::Reading;
use verdant_core::error::TransportError;
use verdant_core::polling::{IterationResult, PollingProcessor, run_polling_loop};
use verdant_core::registrar::Registrar;
use verdant_core::retry::{RetryPolicy, retry_with_policy};
use verdant_core::transport::{ConsumedRecord, Transport};

use crate::checkpoint::EngineCheckpoint;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::events::{
    AggregatesEmitted, BatchAborted, BatchCommitted, CommittedOffset, DecodeFailed, DecodeStage,
    LateRecordsDropped, OpenWindows, RecordsDeferred, RecordsFetched, SchemaStallExhausted,
    SchemaStalled, WatermarkAdvanced,
};
use crate::sink::AggregateSink;
use crate::window::{OpenWindow, TypeWindows, WindowAggregate, WindowSpec};

use batch::{HoldBack, TypeGroups};

/// Partitions fetched concurrently.
const MAX_CONCURRENT_FETCHES: usize = 8;

/// Records pulled for one batch.
#[derive(Debug)]
pub struct FetchedBatch {
    records: Vec<ConsumedRecord>,
}

impl FetchedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Consumes the telemetry topic and maintains the aggregate table.
pub struct IngestionEngine {
    config: EngineConfig,
    spec: WindowSpec,
    fetch_policy: RetryPolicy,
    registrar: Arc<Registrar>,
    transport: Arc<dyn Transport>,
    sink: Box<dyn AggregateSink>,
    /// State as of the last successful commit.
    checkpoint: EngineCheckpoint,
    /// Re-read the checkpoint from the sink before the next fetch.
    needs_recovery: bool,
    consecutive_failures: u32,
}

impl IngestionEngine {
    pub fn new(
        config: EngineConfig,
        registrar: Arc<Registrar>,
        transport: Arc<dyn Transport>,
        sink: Box<dyn AggregateSink>,
    ) -> Self {
        Self {
            spec: config.window.spec(),
            fetch_policy: config.fetch_retry.policy(),
            config,
            registrar,
            transport,
            sink,
            checkpoint: EngineCheckpoint::default(),
            needs_recovery: true,
            consecutive_failures: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// State as of the last successful commit.
    pub fn checkpoint(&self) -> &EngineCheckpoint {
        &self.checkpoint
    }

    /// Run a single fetch-and-process cycle.
    pub async fn step(&mut self) -> Result<IterationResult, EngineError> {
        match self.prepare(false).await? {
            Some(batch) => self.process(batch).await,
            None => Ok(IterationResult::NoItems),
        }
    }

    /// Run batches until `shutdown` is cancelled.
    ///
    /// A batch already taken when shutdown arrives still commits or aborts.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), EngineError> {
        let name = self.config.name.clone();
        let interval = self.config.batch.interval();
        info!(
            target = %name,
            topic = %self.config.topic,
            sink = %self.sink.name(),
            "Starting ingestion engine"
        );
        run_polling_loop(&mut self, interval, shutdown, &name, "bronze").await?;
        info!(target = %name, batch_id = self.checkpoint.batch_id, "Ingestion engine stopped");
        Ok(())
    }

    async fn recover(&mut self) -> Result<(), EngineError> {
        let recovered = self.sink.recover_checkpoint().await?;
        match recovered {
            Some(checkpoint) => {
                info!(
                    target = %self.config.name,
                    batch_id = checkpoint.batch_id,
                    offset = checkpoint.total_offset(),
                    open_windows = checkpoint.open_windows.len(),
                    "Resuming from committed checkpoint"
                );
                self.checkpoint = checkpoint;
            }
            None => {
                info!(target = %self.config.name, "No committed checkpoint, starting from offset 0");
                self.checkpoint = EngineCheckpoint::default();
            }
        }
        self.needs_recovery = false;
        Ok(())
    }

    /// Fetch up to `batch.max_records` records past the committed offsets.
    async fn fetch(&self) -> Result<Vec<ConsumedRecord>, EngineError> {
        let topic = self.config.topic.as_str();
        let transport = &self.transport;
        let policy = &self.fetch_policy;

        let partitions = retry_with_policy(
            policy,
            "partition_count",
            TransportError::is_retriable,
            |_| transport.partition_count(topic),
        )
        .await
        .map_err(|e| EngineError::Topic {
            topic: topic.to_string(),
            source: e.source,
        })?;

        let budget = (self.config.batch.max_records / partitions.max(1) as usize).max(1);
        let fetches = (0..partitions).map(|partition| {
            let offset = self.checkpoint.offset(partition);
            async move {
                retry_with_policy(policy, "fetch", TransportError::is_retriable, |_| {
                    transport.fetch(topic, partition, offset, budget)
                })
                .await
                .map_err(|e| EngineError::Fetch {
                    topic: topic.to_string(),
                    partition,
                    source: e.source,
                })
            }
        });

        let per_partition: Vec<Vec<ConsumedRecord>> = futures::stream::iter(fetches)
            .buffered(MAX_CONCURRENT_FETCHES)
            .try_collect()
            .await?;
        Ok(per_partition.into_iter().flatten().collect())
    }

    /// Count an aborted batch. Fails once the configured cap is reached.
    fn record_failure(&mut self, err: EngineError) -> Result<IterationResult, EngineError> {
        self.consecutive_failures += 1;
        self.needs_recovery = true;
        emit!(BatchAborted {
            target: self.config.name.clone(),
        });
        warn!(
            target = %self.config.name,
            batch_id = self.checkpoint.batch_id + 1,
            consecutive_failures = self.consecutive_failures,
            error = %err,
            "Batch aborted, committed state unchanged"
        );

        let cap = self.config.max_consecutive_failures;
        if cap > 0 && self.consecutive_failures >= cap {
            return Err(EngineError::ConsecutiveFailures {
                failures: self.consecutive_failures,
                last_error: err.to_string(),
            });
        }
        Ok(IterationResult::Aborted)
    }

    async fn run_batch(&mut self, batch: FetchedBatch) -> Result<IterationResult, EngineError> {
        let started = Instant::now();
        let target = self.config.name.clone();
        let mut next = self.checkpoint.clone();
        next.batch_id += 1;
        let batch_watermark = self.spec.watermark(self.checkpoint.max_event_time_ms);

        emit!(RecordsFetched {
            count: batch.len() as u64,
            target: target.clone(),
        });

        // TYPE_GROUPED
        let grouped = TypeGroups::from_records(batch.records);

        // SCHEMA_RESOLVED
        let mut hold_back = HoldBack::default();
        let mut resolved = Vec::with_capacity(grouped.groups.len());
        for (schema_id, pending) in grouped.groups {
            match self.registrar.resolve_id(schema_id).await {
                Ok(schema) => {
                    next.schema_stalls.remove(&schema_id.0);
                    resolved.push((schema, pending));
                }
                Err(err) => {
                    let stalls = next.schema_stalls.entry(schema_id.0).or_insert(0);
                    *stalls = stalls.saturating_add(1);
                    if *stalls <= self.config.max_schema_stall_batches {
                        warn!(
                            target = %target,
                            schema_id = schema_id.0,
                            consecutive = *stalls,
                            records = pending.len(),
                            error = %err,
                            "Schema did not resolve, holding back its partitions"
                        );
                        emit!(SchemaStalled {
                            schema_id: schema_id.0,
                            consecutive: *stalls,
                        });
                        for record in &pending {
                            hold_back.hold(record.partition, record.offset);
                        }
                    } else {
                        error!(
                            target = %target,
                            schema_id = schema_id.0,
                            consecutive = *stalls,
                            dropped = pending.len(),
                            error = %err,
                            "Schema still unresolved after {} batches, dropping its records",
                            self.config.max_schema_stall_batches
                        );
                        emit!(SchemaStallExhausted {
                            schema_id: schema_id.0,
                            dropped: pending.len() as u64,
                        });
                    }
                }
            }
        }

        let mut deferred = 0u64;
        let malformed = grouped
            .malformed
            .iter()
            .filter(|(partition, offset)| {
                let held = hold_back.defers(*partition, *offset);
                deferred += u64::from(held);
                !held
            })
            .count();
        if malformed > 0 {
            warn!(target = %target, count = malformed, "Dropping records with malformed headers");
            emit!(DecodeFailed {
                stage: DecodeStage::Header,
                count: malformed as u64,
                target: target.clone(),
            });
        }

        // VALIDATED
        let mut readings: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
        let mut late: BTreeMap<String, u64> = BTreeMap::new();
        let mut invalid = 0u64;
        for (schema, pending) in resolved {
            for record in pending {
                if hold_back.defers(record.partition, record.offset) {
                    deferred += 1;
                    continue;
                }
                let reading = match record.envelope.decode_reading(&schema) {
                    Ok(reading) => reading,
                    Err(err) => {
                        debug!(
                            target = %target,
                            partition = record.partition,
                            offset = record.offset,
                            error = %err,
                            "Dropping record that does not match its schema"
                        );
                        invalid += 1;
                        continue;
                    }
                };
                if let Some(watermark) = batch_watermark
                    && reading.event_time_ms() < watermark
                {
                    *late.entry(reading.device_type.clone()).or_default() += 1;
                    continue;
                }
                next.observe_event_time(reading.event_time_ms());
                readings
                    .entry(reading.device_type.clone())
                    .or_default()
                    .push(reading);
            }
        }
        for (partition, end) in &grouped.fetched_end {
            next.advance(*partition, hold_back.next_offset(*partition, *end));
        }

        if invalid > 0 {
            emit!(DecodeFailed {
                stage: DecodeStage::Payload,
                count: invalid,
                target: target.clone(),
            });
        }
        for (device_type, count) in late {
            debug!(target = %target, device_type = %device_type, count, "Dropping late records");
            emit!(LateRecordsDropped { device_type, count });
        }
        if deferred > 0 {
            emit!(RecordsDeferred {
                count: deferred,
                target: target.clone(),
            });
        }

        // WINDOW_AGGREGATED
        let watermark = self.spec.watermark(next.max_event_time_ms);
        let (aggregates, open_windows) = self
            .aggregate(std::mem::take(&mut next.open_windows), readings, watermark)
            .await?;
        next.open_windows = open_windows;

        if next.offsets == self.checkpoint.offsets
            && next.schema_stalls == self.checkpoint.schema_stalls
            && next.open_windows == self.checkpoint.open_windows
        {
            return Ok(IterationResult::NoItems);
        }

        // COMMITTED
        next.last_update_ts = Utc::now().timestamp_millis();
        let version = self.sink.commit(&aggregates, &next).await?;

        let mut emitted: BTreeMap<&str, u64> = BTreeMap::new();
        for aggregate in &aggregates {
            *emitted.entry(aggregate.device_type.as_str()).or_default() += 1;
        }
        for (device_type, count) in emitted {
            emit!(AggregatesEmitted {
                device_type: device_type.to_string(),
                count,
            });
        }
        for (partition, offset) in &next.offsets {
            emit!(CommittedOffset {
                partition: *partition,
                offset: *offset,
            });
        }
        if let Some(watermark_ms) = watermark {
            emit!(WatermarkAdvanced { watermark_ms });
        }
        emit!(OpenWindows {
            count: next.open_windows.len(),
        });
        emit!(BatchCommitted {
            duration: started.elapsed(),
            target: target.clone(),
        });
        info!(
            target = %target,
            batch_id = next.batch_id,
            version,
            aggregates = aggregates.len(),
            open_windows = next.open_windows.len(),
            offset = next.total_offset(),
            "Committed batch"
        );

        self.checkpoint = next;
        Ok(IterationResult::ProcessedItems)
    }

    /// Fold readings into the open windows of their device type, one task per
    /// type, and finalize every window the watermark has passed.
    async fn aggregate(
        &self,
        open_windows: Vec<OpenWindow>,
        readings: BTreeMap<String, Vec<Reading>>,
        watermark: Option<i64>,
    ) -> Result<(Vec<WindowAggregate>, Vec<OpenWindow>), EngineError> {
        let mut states: HashMap<String, TypeWindows> = HashMap::new();
        for window in open_windows {
            states
                .entry(window.device_type.clone())
                .or_insert_with(|| {
                    TypeWindows::new(
                        window.device_type.clone(),
                        self.config.metric_for(&window.device_type),
                        self.spec,
                    )
                })
                .restore(window);
        }
        for device_type in readings.keys() {
            states.entry(device_type.clone()).or_insert_with(|| {
                TypeWindows::new(
                    device_type.clone(),
                    self.config.metric_for(device_type),
                    self.spec,
                )
            });
        }

        let mut readings = readings;
        let mut tasks = JoinSet::new();
        for (device_type, mut windows) in states {
            let batch = readings.remove(&device_type).unwrap_or_default();
            tasks.spawn(async move {
                for reading in &batch {
                    windows.add(reading);
                }
                let finished = match watermark {
                    Some(watermark) => windows.finalize(watermark),
                    None => Vec::new(),
                };
                (windows, finished)
            });
        }

        let mut aggregates = Vec::new();
        let mut remaining = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (windows, finished) = joined.map_err(|source| EngineError::TaskJoin { source })?;
            aggregates.extend(finished);
            remaining.push(windows);
        }

        aggregates.sort_by(|a, b| {
            (&a.device_type, a.window_start, &a.source_id).cmp(&(
                &b.device_type,
                b.window_start,
                &b.source_id,
            ))
        });
        remaining.sort_by(|a, b| a.device_type().cmp(b.device_type()));
        let open_windows = remaining
            .iter()
            .flat_map(|windows| windows.snapshot())
            .collect();
        Ok((aggregates, open_windows))
    }
}

#[async_trait]
impl PollingProcessor for IngestionEngine {
    type State = FetchedBatch;
    type Error = EngineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<FetchedBatch>, EngineError> {
        if (cold_start || self.needs_recovery)
            && let Err(err) = self.recover().await
        {
            return self.record_failure(err).map(|_| None);
        }

        match self.fetch().await {
            Ok(records) if records.is_empty() => Ok(None),
            Ok(records) => Ok(Some(FetchedBatch { records })),
            Err(err) => self.record_failure(err).map(|_| None),
        }
    }

    async fn process(&mut self, batch: FetchedBatch) -> Result<IterationResult, EngineError> {
        match self.run_batch(batch).await {
            Ok(result) => {
                self.consecutive_failures = 0;
                Ok(result)
            }
            Err(err) => self.record_failure(err),
        }
    }
}
