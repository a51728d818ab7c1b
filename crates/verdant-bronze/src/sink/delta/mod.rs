//! Delta Lake sink for window aggregates.
//!
//! Each batch becomes one Delta commit: a Parquet file per
//! `(device_type, window_start)` partition plus a `Txn` action recording the
//! batch id. The engine checkpoint for that batch is written under
//! `_verdant_state/` before the commit and only counts once a commit names
//! its batch, so output and checkpoint become visible together or not at
//! all. Every `delta_checkpoint_interval` commits a Delta checkpoint is
//! written so readers need not replay the whole log.

mod actions;
mod parquet;
mod table;

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deltalake::DeltaTable;
use deltalake::kernel::Action;
use deltalake::kernel::transaction::CommitBuilder;
use deltalake::protocol::{DeltaOperation, SaveMode};
use object_store::path::Path;
use tracing::{debug, info, warn};

use verdant_core::storage::StorageProvider;

use super::AggregateSink;
use crate::checkpoint::EngineCheckpoint;
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::metrics::events::{DeltaCommitCompleted, InternalEvent};
use crate::window::WindowAggregate;

pub use table::{PARTITION_COLUMNS, table_schema};

/// Maximum number of Delta log versions scanned when recovering a checkpoint.
const CHECKPOINT_RECOVERY_SCAN_LIMIT: i64 = 1000;

/// Delta Lake table of window aggregates.
pub struct DeltaAggregateSink {
    table: DeltaTable,
    storage: StorageProvider,
    table_name: String,
    checkpoint_interval: usize,
    commits_since_checkpoint: usize,
    /// Batch whose checkpoint object is the live one.
    last_committed_batch: Option<u64>,
}

impl DeltaAggregateSink {
    /// Open the table at `config.table_uri`, creating it when missing.
    pub async fn open(config: &SinkConfig, table_name: String) -> Result<Self, SinkError> {
        table::ensure_handlers_registered();

        let storage =
            StorageProvider::for_url_with_options(&config.table_uri, config.storage_options.clone())
                .await
                .map_err(|source| SinkError::Storage { source })?;
        let table = table::load_or_create_table(&storage, &table_name).await?;

        Ok(Self {
            table,
            storage,
            table_name,
            checkpoint_interval: config.delta_checkpoint_interval,
            commits_since_checkpoint: 0,
            last_committed_batch: None,
        })
    }

    /// Current table version, `-1` before the first commit.
    pub fn version(&self) -> i64 {
        self.table.version().unwrap_or(-1)
    }

    /// Write a Delta checkpoint once `checkpoint_interval` commits have
    /// accumulated. A failed attempt is retried after the next commit.
    async fn maybe_create_table_checkpoint(&mut self) {
        if self.checkpoint_interval == 0 {
            return;
        }

        self.commits_since_checkpoint += 1;
        if self.commits_since_checkpoint < self.checkpoint_interval {
            return;
        }

        match deltalake::checkpoints::create_checkpoint(&self.table, None).await {
            Ok(()) => {
                info!(
                    target = %self.table_name,
                    "Created table checkpoint at version {}",
                    self.version()
                );
                self.commits_since_checkpoint = 0;
            }
            Err(e) => {
                warn!(target = %self.table_name, "Failed to create table checkpoint: {e}");
            }
        }
    }

    /// Remove the checkpoint object of a batch that has been superseded.
    async fn remove_checkpoint_state(&self, batch_id: u64) {
        let path = actions::checkpoint_state_path(batch_id);
        if let Err(e) = self.storage.delete(&Path::from(path.as_str())).await {
            warn!(target = %self.table_name, "Failed to remove {path}: {e}");
        }
    }

    /// Write one data file per partition and return their Add actions.
    async fn write_data_files(
        &self,
        aggregates: &[WindowAggregate],
    ) -> Result<Vec<Action>, SinkError> {
        let mut groups: BTreeMap<(&str, DateTime<Utc>), Vec<&WindowAggregate>> = BTreeMap::new();
        for aggregate in aggregates {
            groups
                .entry((aggregate.device_type.as_str(), aggregate.window_start))
                .or_default()
                .push(aggregate);
        }

        let mut add_actions = Vec::with_capacity(groups.len());
        for ((device_type, window_start), rows) in groups {
            let bytes = parquet::encode(&rows)?;
            let size = bytes.len();
            let file_id = uuid::Uuid::now_v7().to_string();
            let path = actions::data_file_path(device_type, &window_start, &file_id);

            self.storage
                .put(&Path::from(path.as_str()), bytes)
                .await
                .map_err(|source| SinkError::Storage { source })?;
            debug!(target = %self.table_name, "Wrote {} rows to {}", rows.len(), path);

            add_actions.push(actions::create_add_action(
                &path,
                size,
                device_type,
                &window_start,
            ));
        }
        Ok(add_actions)
    }
}

#[async_trait]
impl AggregateSink for DeltaAggregateSink {
    async fn commit(
        &mut self,
        aggregates: &[WindowAggregate],
        checkpoint: &EngineCheckpoint,
    ) -> Result<i64, SinkError> {
        let start = Instant::now();

        let add_actions = self.write_data_files(aggregates).await?;
        let files = add_actions.len();

        let batch_id = checkpoint.batch_id;
        self.storage
            .put(
                &Path::from(actions::checkpoint_state_path(batch_id).as_str()),
                actions::encode_checkpoint(checkpoint)?,
            )
            .await
            .map_err(|source| SinkError::Storage { source })?;

        let mut all_actions = Vec::with_capacity(files + 1);
        all_actions.push(actions::create_txn_action(batch_id));
        all_actions.extend(add_actions);

        let snapshot = self
            .table
            .snapshot()
            .map_err(|source| SinkError::DeltaOperation { source })?;
        let version = CommitBuilder::default()
            .with_actions(all_actions)
            .build(
                Some(snapshot),
                self.table.log_store(),
                DeltaOperation::Write {
                    mode: SaveMode::Append,
                    partition_by: Some(PARTITION_COLUMNS.iter().map(|c| c.to_string()).collect()),
                    predicate: None,
                },
            )
            .await
            .map_err(|source| SinkError::DeltaOperation { source })?
            .version;

        self.table
            .load()
            .await
            .map_err(|source| SinkError::DeltaOperation { source })?;

        DeltaCommitCompleted {
            duration: start.elapsed(),
            files,
            table: self.table_name.clone(),
        }
        .emit();
        debug!(
            target = %self.table_name,
            "Committed batch {} as version {} ({} files)",
            batch_id,
            version,
            files
        );

        if let Some(previous) = self.last_committed_batch.replace(batch_id)
            && previous != batch_id
        {
            self.remove_checkpoint_state(previous).await;
        }
        self.maybe_create_table_checkpoint().await;

        Ok(version)
    }

    /// Find the last batch committed by the engine and load its checkpoint.
    ///
    /// Every engine commit carries the Txn, so the scan normally stops at
    /// the latest version; it only goes further back past foreign writers.
    async fn recover_checkpoint(&mut self) -> Result<Option<EngineCheckpoint>, SinkError> {
        use deltalake::logstore::{get_actions, read_commit_entry};

        self.table
            .load()
            .await
            .map_err(|source| SinkError::DeltaOperation { source })?;

        let current_version = self.version();
        info!(
            target = %self.table_name,
            "Recovering checkpoint from Delta log, current_version={}",
            current_version
        );
        if current_version < 0 {
            return Ok(None);
        }

        let object_store = self.table.log_store().object_store(None);
        let start_version = (current_version - CHECKPOINT_RECOVERY_SCAN_LIMIT).max(0);

        for version in (start_version..=current_version).rev() {
            let Some(commit_bytes) = read_commit_entry(object_store.as_ref(), version)
                .await
                .map_err(|source| SinkError::DeltaOperation { source })?
            else {
                continue;
            };

            let commit_actions = get_actions(version, &commit_bytes)
                .map_err(|source| SinkError::DeltaOperation { source })?;

            let Some(batch_id) = commit_actions.iter().find_map(actions::committed_batch) else {
                continue;
            };

            let path = actions::checkpoint_state_path(batch_id);
            let bytes = self
                .storage
                .get_opt(&Path::from(path.as_str()))
                .await
                .map_err(|source| SinkError::Storage { source })?
                .ok_or_else(|| SinkError::InvalidCheckpoint {
                    message: format!(
                        "version {version} commits batch {batch_id} but {path} is missing"
                    ),
                })?;
            let checkpoint = actions::decode_checkpoint(batch_id, &bytes)?;

            info!(
                target = %self.table_name,
                "Recovered checkpoint for batch {} from version {}",
                batch_id,
                version
            );
            self.last_committed_batch = Some(batch_id);
            return Ok(Some(checkpoint));
        }

        if current_version > 0 {
            warn!(
                target = %self.table_name,
                "No checkpoint found in Delta log after scanning versions {}..{}, starting from the beginning of the topic",
                start_version,
                current_version
            );
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        &self.table_name
    }
}
