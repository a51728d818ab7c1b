//! Checkpoint state serialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::window::OpenWindow;

fn default_schema_version() -> u32 {
    1
}

/// Complete engine state after a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    /// Schema version for forward compatibility.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Number of committed batches.
    pub batch_id: u64,
    /// Partition → next offset to read. Never decreases.
    pub offsets: BTreeMap<u32, u64>,
    /// Highest event time accepted so far.
    #[serde(default)]
    pub max_event_time_ms: Option<i64>,
    #[serde(default)]
    pub open_windows: Vec<OpenWindow>,
    /// Schema id → consecutive batches it failed to resolve.
    #[serde(default)]
    pub schema_stalls: BTreeMap<u32, u32>,
    /// Wall-clock time of the commit, epoch milliseconds.
    #[serde(default)]
    pub last_update_ts: i64,
}

impl Default for EngineCheckpoint {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            batch_id: 0,
            offsets: BTreeMap::new(),
            max_event_time_ms: None,
            open_windows: Vec::new(),
            schema_stalls: BTreeMap::new(),
            last_update_ts: 0,
        }
    }
}

impl EngineCheckpoint {
    /// Next offset to read from `partition`.
    pub fn offset(&self, partition: u32) -> u64 {
        self.offsets.get(&partition).copied().unwrap_or(0)
    }

    /// Move a partition's offset forward. Lower offsets are ignored.
    pub fn advance(&mut self, partition: u32, next_offset: u64) {
        let offset = self.offsets.entry(partition).or_insert(0);
        *offset = (*offset).max(next_offset);
    }

    pub fn observe_event_time(&mut self, event_ms: i64) {
        self.max_event_time_ms = Some(self.max_event_time_ms.map_or(event_ms, |m| m.max(event_ms)));
    }

    /// Total records consumed across partitions.
    pub fn total_offset(&self) -> u64 {
        self.offsets.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Accumulator;

    #[test]
    fn test_default() {
        let state = EngineCheckpoint::default();
        assert_eq!(state.schema_version, 1);
        assert_eq!(state.batch_id, 0);
        assert_eq!(state.offset(3), 0);
        assert!(state.max_event_time_ms.is_none());
    }

    #[test]
    fn test_offsets_never_decrease() {
        let mut state = EngineCheckpoint::default();
        state.advance(0, 10);
        state.advance(0, 4);
        state.advance(1, 2);
        assert_eq!(state.offset(0), 10);
        assert_eq!(state.offset(1), 2);
        assert_eq!(state.total_offset(), 12);
    }

    #[test]
    fn test_json_roundtrip_with_integer_keys() {
        let mut state = EngineCheckpoint {
            batch_id: 7,
            ..Default::default()
        };
        state.advance(2, 100);
        state.observe_event_time(1_700_000_000_000);
        state.schema_stalls.insert(5, 3);
        state.open_windows.push(OpenWindow {
            device_type: "soil_moisture".into(),
            source_id: "farm_1".into(),
            window_start_ms: 1_699_999_800_000,
            accumulator: Accumulator {
                count: 2,
                observed: 2,
                sum: 84.0,
                min: Some(40.0),
                max: Some(44.0),
            },
        });

        let json = serde_json::to_string(&state).unwrap();
        let restored: EngineCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_backwards_compatible() {
        let json = r#"{"batch_id":3,"offsets":{"0":12}}"#;
        let state: EngineCheckpoint = serde_json::from_str(json).unwrap();
        assert_eq!(state.schema_version, 1);
        assert_eq!(state.offset(0), 12);
        assert!(state.open_windows.is_empty());
    }
}
