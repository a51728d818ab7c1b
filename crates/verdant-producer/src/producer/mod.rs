//! The telemetry producer.
//!
//! Construction registers (or resolves) the schema of every configured
//! device type and inspects the topic; a producer that exists is fully
//! initialized. After that, `emit` validates and enqueues without waiting
//! and `flush` is the only call that suspends.

mod delivery;

pub use delivery::{DeliveryCallback, DeliveryOutcome, DeliveryReceipt, LoggingCallback};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use snafu::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use verdant_core::emit;
use verdant_core::envelope::{Envelope, Reading};
use verdant_core::metrics::events::{InFlightMessages, ReadingRejected, RejectReason};
use verdant_core::registrar::Registrar;
use verdant_core::retry::retry_with_policy;
use verdant_core::schema::{FieldValue, SchemaDefinition};
use verdant_core::transport::{ProduceRecord, Transport, partition_for};

use crate::config::ProducerConfig;
use crate::error::{
    ClosedSnafu, EncodeSnafu, FlushTimeoutSnafu, ProducerError, QueueFullSnafu,
    SchemaMismatchSnafu, StartupSnafu, TopicUnavailableSnafu, TransportError,
    UnknownDeviceTypeSnafu, UnregisteredSchemaSnafu,
};

use delivery::{DeliveryTask, Pending};

/// Confirmation that `emit` accepted a reading for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub sequence: u64,
    pub partition: u32,
}

/// Publishes schema-tagged readings to the shared topic.
pub struct TelemetryProducer {
    client_id: String,
    topic: String,
    partitions: u32,
    producer_id: u64,
    queue_capacity: usize,
    schemas: IndexMap<String, Arc<SchemaDefinition>>,
    next_sequence: AtomicU64,
    in_flight: Arc<watch::Sender<usize>>,
    tx: Mutex<Option<mpsc::Sender<Pending>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryProducer {
    /// Register every configured device type and start the delivery task.
    ///
    /// Fails before anything is sent if any device type cannot be registered
    /// or resolved, or the topic cannot be inspected.
    pub async fn new(
        config: &ProducerConfig,
        registrar: Arc<Registrar>,
        transport: Arc<dyn Transport>,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Self, ProducerError> {
        let mut schemas = IndexMap::with_capacity(config.device_types.len());
        for (device_type, declared) in &config.device_types {
            let schema = match declared {
                Some(declared) => registrar.register(device_type, declared).await,
                None => registrar.resolve(device_type).await,
            }
            .context(StartupSnafu { device_type })?;
            info!(
                device_type = %device_type,
                schema_id = %schema.schema_id,
                version = schema.version,
                "Schema ready"
            );
            schemas.insert(device_type.clone(), schema);
        }

        let policy = config.delivery_policy();
        let partitions = retry_with_policy(
            &policy,
            "transport.partition_count",
            TransportError::is_retriable,
            |_| transport.partition_count(&config.topic),
        )
        .await
        .map_err(|e| e.source)
        .context(TopicUnavailableSnafu {
            topic: &config.topic,
        })?;

        let producer_id = rand::random::<u64>();
        let in_flight = Arc::new(watch::Sender::new(0usize));
        let task = DeliveryTask::spawn(
            transport,
            config.topic.clone(),
            policy,
            config.queue_capacity,
            callback,
            Arc::clone(&in_flight),
        );

        info!(
            client_id = %config.client_id,
            topic = %config.topic,
            partitions,
            producer_id,
            device_types = schemas.len(),
            "Producer started"
        );

        Ok(Self {
            client_id: config.client_id.clone(),
            topic: config.topic.clone(),
            partitions,
            producer_id,
            queue_capacity: config.queue_capacity,
            schemas,
            next_sequence: AtomicU64::new(0),
            in_flight,
            tx: Mutex::new(Some(task.tx)),
            handle: Mutex::new(Some(task.handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    /// Schemas this producer publishes, in configuration order.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<SchemaDefinition>> {
        self.schemas.values()
    }

    pub fn schema(&self, device_type: &str) -> Option<&Arc<SchemaDefinition>> {
        self.schemas.get(device_type)
    }

    /// Messages accepted but not yet resolved.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Build a reading stamped with the current schema id and time.
    pub fn reading(
        &self,
        device_type: &str,
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        field_values: IndexMap<String, FieldValue>,
    ) -> Result<Reading, ProducerError> {
        let schema = self
            .schemas
            .get(device_type)
            .context(UnknownDeviceTypeSnafu { device_type })?;
        Ok(Reading {
            device_type: device_type.to_string(),
            source_id: source_id.into(),
            timestamp,
            schema_id: schema.schema_id,
            field_values,
        })
    }

    fn reject(&self, reason: RejectReason, device_type: &str) {
        emit!(ReadingRejected {
            reason,
            device_type: device_type.to_string(),
        });
    }

    /// Validate, encode and enqueue a reading. Never waits for the transport.
    pub fn emit(&self, reading: Reading) -> Result<Accepted, ProducerError> {
        let device_type = reading.device_type.as_str();
        let Some(schema) = self.schemas.get(device_type) else {
            self.reject(RejectReason::UnknownSchema, device_type);
            return UnknownDeviceTypeSnafu { device_type }.fail();
        };
        if reading.schema_id != schema.schema_id {
            self.reject(RejectReason::UnknownSchema, device_type);
            return UnregisteredSchemaSnafu {
                device_type,
                schema_id: reading.schema_id.0,
                expected: schema.schema_id.0,
            }
            .fail();
        }
        if let Err(mismatch) = schema.validate(&reading.field_values) {
            self.reject(RejectReason::SchemaMismatch, device_type);
            return Err(mismatch).context(SchemaMismatchSnafu);
        }

        let envelope = Envelope::from_reading(&reading).context(EncodeSnafu)?;
        let partition = partition_for(&reading.source_id, self.partitions);
        let payload = envelope.encode();

        // Sequences must reach the queue in allocation order.
        let guard = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.reject(RejectReason::Closed, device_type);
            return ClosedSnafu.fail();
        };
        let permit = match tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.reject(RejectReason::QueueFull, device_type);
                return QueueFullSnafu {
                    capacity: self.queue_capacity,
                }
                .fail();
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                self.reject(RejectReason::Closed, device_type);
                return ClosedSnafu.fail();
            }
        };

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = ProduceRecord {
            partition,
            key: reading.source_id.clone(),
            payload,
            producer_id: self.producer_id,
            sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        self.in_flight.send_modify(|count| *count += 1);
        permit.send(Pending { envelope, record });
        drop(guard);

        emit!(InFlightMessages {
            count: self.in_flight(),
            topic: self.topic.clone(),
        });

        Ok(Accepted {
            sequence,
            partition,
        })
    }

    /// Wait until every accepted message has resolved, or `timeout` elapses.
    pub async fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        let mut rx = self.in_flight.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0)).await {
            Ok(_) => Ok(()),
            Err(_) => FlushTimeoutSnafu {
                pending: self.in_flight(),
            }
            .fail(),
        }
    }

    /// Flush, stop accepting readings and stop the delivery task.
    ///
    /// Messages still outstanding at the deadline are abandoned without a
    /// receipt. Calling `close` more than once is a no-op.
    pub async fn close(&self, timeout: Duration) -> Result<(), ProducerError> {
        let flushed = self.flush(timeout).await;

        // Dropping the last sender lets the task drain and exit.
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(handle) = handle {
            if flushed.is_ok() {
                let _ = handle.await;
            } else {
                warn!(
                    client_id = %self.client_id,
                    pending = self.in_flight(),
                    "Aborting delivery task with messages outstanding"
                );
                handle.abort();
            }
        }
        info!(client_id = %self.client_id, "Producer closed");
        flushed
    }
}

impl Drop for TelemetryProducer {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.handle.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
    }
}
