//! Topic log stored as one object per record.
//!
//! Layout under the storage root:
//!
//! ```text
//! {topic}/_topic.json                         topic descriptor
//! {topic}/{partition:05}/{offset:020}.json    one record
//! ```
//!
//! Appends use create-if-absent puts, so every offset is written exactly
//! once and partitions stay contiguous even with several writers. A writer
//! that loses the race for an offset moves to the next one.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, stream};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::emit;
use crate::error::{
    EntryDecodeSnafu, EntryEncodeSnafu, LogStorageSnafu, OutOfOrderSequenceSnafu,
    PartitionOutOfRangeSnafu, TopicNotFoundSnafu, TransportError,
};
use crate::metrics::events::DuplicateSuppressed;
use crate::storage::{StorageProvider, StorageProviderRef};

use super::{
    ConsumedRecord, ProduceRecord, RecordPosition, TopicAdmin, TopicOutcome, TopicSpec, Transport,
};

const DESCRIPTOR_FILE: &str = "_topic.json";
/// Concurrent object reads per fetch.
const FETCH_CONCURRENCY: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    producer_id: u64,
    sequence: u64,
    key: String,
    timestamp_ms: i64,
    /// Base64 of the encoded envelope.
    payload: String,
}

/// Last append seen from a producer on one partition.
#[derive(Debug, Clone, Copy)]
struct ProducerState {
    sequence: u64,
    offset: u64,
}

type PartitionKey = (String, u32);

/// A [`Transport`] and [`TopicAdmin`] over object storage.
pub struct ObjectLog {
    storage: StorageProviderRef,
    topics: DashMap<String, TopicSpec>,
    /// Next offset to try per partition. A hint: appends still race safely.
    next_offsets: DashMap<PartitionKey, u64>,
    producers: DashMap<(String, u32, u64), ProducerState>,
}

impl ObjectLog {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            topics: DashMap::new(),
            next_offsets: DashMap::new(),
            producers: DashMap::new(),
        }
    }

    pub async fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        let storage =
            StorageProvider::for_url_with_options(&config.url, config.storage_options.clone())
                .await
                .context(LogStorageSnafu)?;
        info!(url = storage.canonical_url(), "Opened transport log");
        Ok(Self::new(Arc::new(storage)))
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    fn descriptor_path(topic: &str) -> Path {
        Path::from(format!("{topic}/{DESCRIPTOR_FILE}"))
    }

    fn partition_path(topic: &str, partition: u32) -> Path {
        Path::from(format!("{topic}/{partition:05}"))
    }

    fn record_path(topic: &str, partition: u32, offset: u64) -> Path {
        Path::from(format!("{topic}/{partition:05}/{offset:020}.json"))
    }

    async fn spec(&self, topic: &str) -> Result<TopicSpec, TransportError> {
        if let Some(spec) = self.topics.get(topic) {
            return Ok(spec.clone());
        }
        let path = Self::descriptor_path(topic);
        let bytes = self
            .storage
            .get_opt(&path)
            .await
            .context(LogStorageSnafu)?
            .context(TopicNotFoundSnafu { topic })?;
        let spec: TopicSpec = serde_json::from_slice(&bytes).map_err(|e| {
            EntryDecodeSnafu {
                path: path.to_string(),
                message: e.to_string(),
            }
            .build()
        })?;
        self.topics.insert(topic.to_string(), spec.clone());
        Ok(spec)
    }

    async fn check_partition(&self, topic: &str, partition: u32) -> Result<(), TransportError> {
        let partitions = self.spec(topic).await?.partitions;
        ensure!(
            partition < partitions,
            PartitionOutOfRangeSnafu {
                topic,
                partition,
                partitions,
            }
        );
        Ok(())
    }

    /// Offset after the last record found by listing the partition.
    async fn discover_next_offset(&self, topic: &str, partition: u32) -> Result<u64, TransportError> {
        let listed = self
            .storage
            .list_with_prefix(&Self::partition_path(topic, partition))
            .await
            .context(LogStorageSnafu)?;
        let next = listed
            .iter()
            .filter_map(|path| path.filename()?.strip_suffix(".json")?.parse::<u64>().ok())
            .max()
            .map_or(0, |last| last + 1);
        debug!(topic, partition, next, "Discovered partition end");
        Ok(next)
    }

    async fn next_offset(&self, topic: &str, partition: u32) -> Result<u64, TransportError> {
        let key = (topic.to_string(), partition);
        if let Some(next) = self.next_offsets.get(&key) {
            return Ok(*next);
        }
        let next = self.discover_next_offset(topic, partition).await?;
        Ok(*self.next_offsets.entry(key).or_insert(next))
    }

    fn advance(&self, topic: &str, partition: u32, offset: u64) {
        self.next_offsets
            .entry((topic.to_string(), partition))
            .and_modify(|next| *next = (*next).max(offset + 1))
            .or_insert(offset + 1);
    }

    async fn read_entry(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<Option<LogEntry>, TransportError> {
        let path = Self::record_path(topic, partition, offset);
        let Some(bytes) = self.storage.get_opt(&path).await.context(LogStorageSnafu)? else {
            return Ok(None);
        };
        let entry = serde_json::from_slice(&bytes).map_err(|e| {
            EntryDecodeSnafu {
                path: path.to_string(),
                message: e.to_string(),
            }
            .build()
        })?;
        Ok(Some(entry))
    }

    fn record_sent(&self, topic: &str, record: &ProduceRecord, offset: u64) {
        self.advance(topic, record.partition, offset);
        self.producers.insert(
            (topic.to_string(), record.partition, record.producer_id),
            ProducerState {
                sequence: record.sequence,
                offset,
            },
        );
    }
}

#[async_trait]
impl Transport for ObjectLog {
    async fn partition_count(&self, topic: &str) -> Result<u32, TransportError> {
        Ok(self.spec(topic).await?.partitions)
    }

    async fn send(
        &self,
        topic: &str,
        record: &ProduceRecord,
    ) -> Result<RecordPosition, TransportError> {
        let partition = record.partition;
        self.check_partition(topic, partition).await?;

        let producer_key = (topic.to_string(), partition, record.producer_id);
        if let Some(state) = self.producers.get(&producer_key).map(|s| *s) {
            if state.sequence == record.sequence {
                emit!(DuplicateSuppressed {
                    topic: topic.to_string(),
                });
                return Ok(RecordPosition {
                    partition,
                    offset: state.offset,
                    duplicate: true,
                });
            }
            ensure!(
                record.sequence > state.sequence,
                OutOfOrderSequenceSnafu {
                    topic,
                    producer_id: record.producer_id,
                    sequence: record.sequence,
                    last_sequence: state.sequence,
                }
            );
        }

        let entry = LogEntry {
            producer_id: record.producer_id,
            sequence: record.sequence,
            key: record.key.clone(),
            timestamp_ms: record.timestamp_ms,
            payload: STANDARD.encode(&record.payload),
        };
        let body = Bytes::from(serde_json::to_vec(&entry).context(EntryEncodeSnafu)?);

        let mut offset = self.next_offset(topic, partition).await?;
        loop {
            let path = Self::record_path(topic, partition, offset);
            match self.storage.put_if_absent(&path, body.clone()).await {
                Ok(()) => {
                    self.record_sent(topic, record, offset);
                    return Ok(RecordPosition {
                        partition,
                        offset,
                        duplicate: false,
                    });
                }
                Err(e) if e.is_already_exists() => {
                    // Either another writer took the offset, or an earlier
                    // attempt of ours landed without being acknowledged.
                    if let Some(existing) = self.read_entry(topic, partition, offset).await?
                        && existing.producer_id == record.producer_id
                        && existing.sequence == record.sequence
                    {
                        self.record_sent(topic, record, offset);
                        emit!(DuplicateSuppressed {
                            topic: topic.to_string(),
                        });
                        return Ok(RecordPosition {
                            partition,
                            offset,
                            duplicate: true,
                        });
                    }
                    self.advance(topic, partition, offset);
                    offset += 1;
                }
                Err(e) => return Err(e).context(LogStorageSnafu),
            }
        }
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<ConsumedRecord>, TransportError> {
        self.check_partition(topic, partition).await?;

        let mut reads = stream::iter(offset..offset.saturating_add(max_records as u64))
            .map(|offset| async move { (offset, self.read_entry(topic, partition, offset).await) })
            .buffered(FETCH_CONCURRENCY);

        let mut records = Vec::new();
        while let Some((offset, entry)) = reads.next().await {
            let Some(entry) = entry? else {
                break;
            };
            let payload = STANDARD.decode(&entry.payload).map_err(|e| {
                EntryDecodeSnafu {
                    path: Self::record_path(topic, partition, offset).to_string(),
                    message: e.to_string(),
                }
                .build()
            })?;
            records.push(ConsumedRecord {
                partition,
                offset,
                key: entry.key,
                timestamp_ms: entry.timestamp_ms,
                payload: Bytes::from(payload),
                producer_id: entry.producer_id,
                sequence: entry.sequence,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl TopicAdmin for ObjectLog {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<TopicOutcome, TransportError> {
        spec.validate()?;
        let body = Bytes::from(serde_json::to_vec(spec).context(EntryEncodeSnafu)?);

        match self
            .storage
            .put_if_absent(&Self::descriptor_path(&spec.name), body)
            .await
        {
            Ok(()) => {
                self.topics.insert(spec.name.clone(), spec.clone());
                Ok(TopicOutcome::Created)
            }
            Err(e) if e.is_already_exists() => {
                let existing = self.spec(&spec.name).await?;
                Ok(TopicOutcome::AlreadyExists {
                    partitions: existing.partitions,
                })
            }
            Err(e) => Err(e).context(LogStorageSnafu),
        }
    }
}
