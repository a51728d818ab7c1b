//! Delta Lake actions for aggregate commits.
//!
//! Every commit carries one `Add` per data file plus a `Txn` under a fixed
//! app_id whose version is the batch id. The engine checkpoint for that
//! batch lives beside the table under `_verdant_state/`, so the snapshot
//! keeps a single engine transaction however many batches are committed.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use deltalake::kernel::{Action, Add, Transaction};

use crate::checkpoint::EngineCheckpoint;
use crate::error::SinkError;
use crate::metrics::events::{CheckpointStateSize, InternalEvent};

/// App id of the engine's Delta Txn actions.
pub const TXN_APP_ID: &str = "verdant-bronze";

/// Directory, relative to the table root, of per-batch checkpoints.
pub const CHECKPOINT_STATE_DIR: &str = "_verdant_state";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Partition value of a window start, in Delta's timestamp format.
pub fn window_start_partition_value(window_start: &DateTime<Utc>) -> String {
    window_start.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Relative path of a data file for one partition.
pub fn data_file_path(device_type: &str, window_start: &DateTime<Utc>, file_id: &str) -> String {
    format!(
        "device_type={}/window_start={}/{}.parquet",
        device_type,
        window_start.format("%Y%m%dT%H%M%SZ"),
        file_id
    )
}

/// Add action for a data file holding one `(device_type, window_start)` group.
pub fn create_add_action(
    path: &str,
    size: usize,
    device_type: &str,
    window_start: &DateTime<Utc>,
) -> Action {
    let partition_values: HashMap<String, Option<String>> = HashMap::from([
        ("device_type".to_string(), Some(device_type.to_string())),
        (
            "window_start".to_string(),
            Some(window_start_partition_value(window_start)),
        ),
    ]);

    Action::Add(Add {
        path: path.to_string(),
        size: i64::try_from(size).unwrap_or(i64::MAX),
        partition_values,
        modification_time: now_millis(),
        data_change: true,
        ..Default::default()
    })
}

/// Txn action marking `batch_id` as committed by the engine.
pub fn create_txn_action(batch_id: u64) -> Action {
    Action::Txn(Transaction {
        app_id: TXN_APP_ID.to_string(),
        version: i64::try_from(batch_id).unwrap_or(i64::MAX),
        last_updated: Some(now_millis()),
    })
}

/// Batch id recorded by an engine Txn action, if `action` is one.
pub fn committed_batch(action: &Action) -> Option<u64> {
    match action {
        Action::Txn(txn) if txn.app_id == TXN_APP_ID => u64::try_from(txn.version).ok(),
        _ => None,
    }
}

/// Relative path of the checkpoint written for `batch_id`.
pub fn checkpoint_state_path(batch_id: u64) -> String {
    format!("{CHECKPOINT_STATE_DIR}/{batch_id:020}.json")
}

pub fn encode_checkpoint(checkpoint: &EngineCheckpoint) -> Result<Bytes, SinkError> {
    let json = serde_json::to_vec(checkpoint)
        .map_err(|source| SinkError::CheckpointJsonEncode { source })?;
    CheckpointStateSize { bytes: json.len() }.emit();
    Ok(Bytes::from(json))
}

/// Decode the checkpoint stored for `batch_id`.
pub fn decode_checkpoint(batch_id: u64, bytes: &[u8]) -> Result<EngineCheckpoint, SinkError> {
    let checkpoint: EngineCheckpoint = serde_json::from_slice(bytes)
        .map_err(|source| SinkError::CheckpointJsonDecode { source })?;
    if checkpoint.batch_id != batch_id {
        return Err(SinkError::InvalidCheckpoint {
            message: format!(
                "{} holds batch {}",
                checkpoint_state_path(batch_id),
                checkpoint.batch_id
            ),
        });
    }
    Ok(checkpoint)
}
