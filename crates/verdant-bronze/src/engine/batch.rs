//! Bookkeeping for one micro-batch between fetch and commit.

use std::collections::BTreeMap;

use verdant_core::envelope::Envelope;
use verdant_core::schema::SchemaId;
use verdant_core::transport::ConsumedRecord;

/// A record whose header decoded.
#[derive(Debug)]
pub(crate) struct Pending {
    pub partition: u32,
    pub offset: u64,
    pub envelope: Envelope,
}

/// Fetched records grouped by the schema id in their header.
#[derive(Debug, Default)]
pub(crate) struct TypeGroups {
    pub groups: BTreeMap<SchemaId, Vec<Pending>>,
    /// Positions of records whose header did not decode.
    pub malformed: Vec<(u32, u64)>,
    /// Partition → offset after the last fetched record.
    pub fetched_end: BTreeMap<u32, u64>,
}

impl TypeGroups {
    /// Group records by schema id. Only the envelope header is read.
    pub fn from_records(records: Vec<ConsumedRecord>) -> Self {
        let mut grouped = Self::default();
        for record in records {
            let end = grouped.fetched_end.entry(record.partition).or_insert(0);
            *end = (*end).max(record.offset + 1);

            match Envelope::decode(record.payload) {
                Ok(envelope) => grouped
                    .groups
                    .entry(envelope.schema_id)
                    .or_default()
                    .push(Pending {
                        partition: record.partition,
                        offset: record.offset,
                        envelope,
                    }),
                Err(_) => grouped.malformed.push((record.partition, record.offset)),
            }
        }
        grouped
    }
}

/// Partition → first offset held back behind a stalled schema.
///
/// Everything in a held partition at or after its hold point is left for a
/// later batch, so the committed offset never skips an unresolved record.
#[derive(Debug, Default)]
pub(crate) struct HoldBack(BTreeMap<u32, u64>);

impl HoldBack {
    pub fn hold(&mut self, partition: u32, offset: u64) {
        let held = self.0.entry(partition).or_insert(offset);
        *held = (*held).min(offset);
    }

    pub fn defers(&self, partition: u32, offset: u64) -> bool {
        self.0.get(&partition).is_some_and(|held| offset >= *held)
    }

    /// Offset to commit for a partition whose fetch ended at `fetched_end`.
    pub fn next_offset(&self, partition: u32, fetched_end: u64) -> u64 {
        self.0
            .get(&partition)
            .map_or(fetched_end, |held| (*held).min(fetched_end))
    }
}
