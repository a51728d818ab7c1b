//! Partitioned append-only transport.
//!
//! Producers append [`ProduceRecord`]s to a topic partition and engines read
//! them back by offset. Each record carries `(producer_id, sequence)` so a
//! retried send of the same logical message is recognised and not appended
//! twice.

mod object_log;
mod provision;

pub use object_log::ObjectLog;
pub use provision::ensure_topics;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{InvalidTopicSpecSnafu, TransportError};

const MAX_TOPIC_NAME_LEN: usize = 249;

/// A topic and the layout it must have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    /// Recorded with the topic. The object log relies on the store's own
    /// durability and does not replicate.
    pub replication_factor: u32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let topic = &self.name;
        ensure!(
            !topic.is_empty() && topic.len() <= MAX_TOPIC_NAME_LEN,
            InvalidTopicSpecSnafu {
                topic,
                message: format!("name must be 1 to {MAX_TOPIC_NAME_LEN} characters"),
            }
        );
        ensure!(
            topic
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
            InvalidTopicSpecSnafu {
                topic,
                message: "name may only contain [a-zA-Z0-9._-]",
            }
        );
        ensure!(
            self.partitions >= 1,
            InvalidTopicSpecSnafu {
                topic,
                message: "partitions must be at least 1",
            }
        );
        ensure!(
            self.replication_factor >= 1,
            InvalidTopicSpecSnafu {
                topic,
                message: "replication_factor must be at least 1",
            }
        );
        Ok(())
    }
}

/// One message handed to [`Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub partition: u32,
    pub key: String,
    pub payload: Bytes,
    pub producer_id: u64,
    /// Monotonic per producer; identifies the logical message across retries.
    pub sequence: u64,
    pub timestamp_ms: i64,
}

/// Where a sent record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: u64,
    /// The record was already present from an earlier attempt.
    pub duplicate: bool,
}

/// A record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub timestamp_ms: i64,
    pub payload: Bytes,
    pub producer_id: u64,
    pub sequence: u64,
}

/// Result of creating one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOutcome {
    Created,
    AlreadyExists { partitions: u32 },
}

/// Append and read access to topic partitions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Number of partitions of a provisioned topic.
    async fn partition_count(&self, topic: &str) -> Result<u32, TransportError>;

    /// Append one record. Resending the same `(producer_id, sequence)` returns
    /// the original position with `duplicate` set.
    async fn send(&self, topic: &str, record: &ProduceRecord)
    -> Result<RecordPosition, TransportError>;

    /// Read up to `max_records` contiguous records starting at `offset`.
    ///
    /// Returns fewer (possibly none) when the partition ends earlier.
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<ConsumedRecord>, TransportError>;
}

/// Topic administration.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<TopicOutcome, TransportError>;
}

/// Stable partition for a record key (FNV-1a).
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ byte as u32).wrapping_mul(PRIME));
    hash % partitions.max(1)
}
