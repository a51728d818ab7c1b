//! In-process sink for all-in-one runs and tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use super::AggregateSink;
use crate::checkpoint::EngineCheckpoint;
use crate::error::SinkError;
use crate::window::WindowAggregate;

#[derive(Default)]
struct Committed {
    /// Keep every aggregate and checkpoint rather than the latest checkpoint.
    keep_history: bool,
    commits: usize,
    aggregates: Vec<WindowAggregate>,
    checkpoints: Vec<EngineCheckpoint>,
    /// Commits to reject before accepting again.
    reject_next: usize,
    /// Commits to accept and then report as failed.
    lose_ack_next: usize,
}

/// Commits held in memory. Clones share the same contents.
///
/// A sink from [`MemorySink::new`] discards aggregates and keeps only the
/// latest checkpoint, so a long-running process stays bounded.
/// [`MemorySink::with_history`] keeps everything for inspection.
#[derive(Clone)]
pub struct MemorySink {
    name: String,
    inner: Arc<Mutex<Committed>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Committed::default())),
        }
    }

    pub fn with_history(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Committed {
                keep_history: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Committed> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Aggregates committed so far, in commit order. Empty without history.
    pub fn aggregates(&self) -> Vec<WindowAggregate> {
        self.lock().aggregates.clone()
    }

    /// Checkpoints in commit order; only the latest without history.
    pub fn checkpoints(&self) -> Vec<EngineCheckpoint> {
        self.lock().checkpoints.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Reject the next `n` commits without applying them.
    pub fn reject_next_commits(&self, n: usize) {
        self.lock().reject_next = n;
    }

    /// Apply the next `n` commits but report them as failed, as when the
    /// acknowledgement of a commit is lost.
    pub fn lose_next_acks(&self, n: usize) {
        self.lock().lose_ack_next = n;
    }
}

#[async_trait]
impl AggregateSink for MemorySink {
    async fn commit(
        &mut self,
        aggregates: &[WindowAggregate],
        checkpoint: &EngineCheckpoint,
    ) -> Result<i64, SinkError> {
        let mut committed = self.lock();
        if committed.reject_next > 0 {
            committed.reject_next -= 1;
            return Err(SinkError::CommitRejected {
                message: "commit rejected".to_string(),
            });
        }
        if committed.keep_history {
            committed.aggregates.extend_from_slice(aggregates);
        } else {
            committed.checkpoints.clear();
        }
        committed.checkpoints.push(checkpoint.clone());
        committed.commits += 1;
        let version = committed.commits as i64 - 1;
        if committed.lose_ack_next > 0 {
            committed.lose_ack_next -= 1;
            return Err(SinkError::CommitRejected {
                message: format!("acknowledgement of version {version} lost"),
            });
        }
        Ok(version)
    }

    async fn recover_checkpoint(&mut self) -> Result<Option<EngineCheckpoint>, SinkError> {
        Ok(self.lock().checkpoints.last().cloned())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_and_recover() {
        let mut sink = MemorySink::new("test");
        assert!(sink.recover_checkpoint().await.unwrap().is_none());

        let checkpoint = EngineCheckpoint {
            batch_id: 1,
            ..Default::default()
        };
        assert_eq!(sink.commit(&[], &checkpoint).await.unwrap(), 0);
        assert_eq!(sink.recover_checkpoint().await.unwrap(), Some(checkpoint));
    }

    #[tokio::test]
    async fn test_default_sink_keeps_only_latest_checkpoint() {
        let mut sink = MemorySink::new("test");
        let row = WindowAggregate {
            window_start: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            window_end: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            source_id: "farm_1".to_string(),
            device_type: "soil_moisture".to_string(),
            metric: "count".to_string(),
            metric_value: Some(1.0),
            record_count: 1,
        };
        for batch_id in 1..=100 {
            let checkpoint = EngineCheckpoint {
                batch_id,
                ..Default::default()
            };
            sink.commit(std::slice::from_ref(&row), &checkpoint)
                .await
                .unwrap();
        }

        assert_eq!(sink.commit_count(), 100);
        assert!(sink.aggregates().is_empty());
        let checkpoints = sink.checkpoints();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].batch_id, 100);
        assert_eq!(sink.recover_checkpoint().await.unwrap().unwrap().batch_id, 100);

        let mut history = MemorySink::with_history("test");
        for batch_id in 1..=3 {
            let checkpoint = EngineCheckpoint {
                batch_id,
                ..Default::default()
            };
            history
                .commit(std::slice::from_ref(&row), &checkpoint)
                .await
                .unwrap();
        }
        assert_eq!(history.aggregates().len(), 3);
        assert_eq!(history.checkpoints().len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_commit_is_not_applied() {
        let mut sink = MemorySink::new("test");
        let handle = sink.clone();
        handle.reject_next_commits(1);

        assert!(sink.commit(&[], &EngineCheckpoint::default()).await.is_err());
        assert_eq!(handle.commit_count(), 0);
        assert!(sink.commit(&[], &EngineCheckpoint::default()).await.is_ok());
        assert_eq!(handle.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_is_applied() {
        let mut sink = MemorySink::new("test");
        sink.lose_next_acks(1);
        assert!(sink.commit(&[], &EngineCheckpoint::default()).await.is_err());
        assert_eq!(sink.commit_count(), 1);
    }
}
