//! Idempotent topic provisioning.

use tracing::{error, info, warn};

use crate::emit;
use crate::error::TransportError;
use crate::metrics::events::TopicProvisioned;
use crate::retry::{RetryPolicy, retry_with_policy};

use super::{TopicAdmin, TopicOutcome, TopicSpec};

/// Make sure every topic in `topics` exists.
///
/// A topic that already exists counts as success, including one whose
/// partition count differs from the request (logged, left unchanged). All
/// topics are attempted before failures are reported together.
pub async fn ensure_topics(
    admin: &dyn TopicAdmin,
    topics: &[TopicSpec],
    retry: &RetryPolicy,
) -> Result<(), TransportError> {
    let mut failed = Vec::new();

    for spec in topics {
        let result = retry_with_policy(retry, "topic.create", TransportError::is_retriable, |_| {
            admin.create_topic(spec)
        })
        .await;

        let outcome = match result {
            Ok(TopicOutcome::Created) => {
                info!(
                    topic = %spec.name,
                    partitions = spec.partitions,
                    replication_factor = spec.replication_factor,
                    "Created topic"
                );
                "created"
            }
            Ok(TopicOutcome::AlreadyExists { partitions }) if partitions == spec.partitions => {
                info!(topic = %spec.name, "Topic already exists");
                "exists"
            }
            Ok(TopicOutcome::AlreadyExists { partitions }) => {
                warn!(
                    topic = %spec.name,
                    expected = spec.partitions,
                    actual = partitions,
                    "Topic exists with a different partition count; leaving it unchanged"
                );
                "mismatch"
            }
            Err(e) => {
                error!(topic = %spec.name, attempts = e.attempts, error = %e.source, "Failed to create topic");
                failed.push(spec.name.clone());
                "failed"
            }
        };
        emit!(TopicProvisioned {
            topic: spec.name.clone(),
            outcome,
        });
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(TransportError::ProvisionFailed { topics: failed })
    }
}
