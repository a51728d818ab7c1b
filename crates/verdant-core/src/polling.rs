//! Generic polling loop trait and runner.
//!
//! `prepare` is raced against shutdown so intake stops promptly. `process` is
//! never interrupted: once a unit of work has been taken it runs to its own
//! success or abort before the loop observes shutdown.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Items were processed successfully.
    ProcessedItems,
    /// No items were available to process.
    NoItems,
    /// The unit of work was rolled back and will be retried.
    Aborted,
}

/// A processor driven by [`run_polling_loop`].
#[async_trait]
pub trait PollingProcessor {
    /// The state type prepared for each iteration.
    type State: Send;
    /// The error type for this processor. Returning it stops the loop.
    type Error: std::error::Error + Send;

    /// Take the next unit of work, or `None` when idle.
    ///
    /// `cold_start` is true on the first iteration, for recovery logic.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process a unit of work taken by `prepare`.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run `processor` until `shutdown` is cancelled or it returns an error.
///
/// After an iteration that processed items the loop polls again immediately;
/// otherwise it waits `poll_interval`.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    shutdown: CancellationToken,
    name: &str,
    service: &'static str,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        if shutdown.is_cancelled() {
            info!(target = name, "Shutdown requested, stopping intake");
            break;
        }

        let iteration_start = Instant::now();
        let prepared = tokio::select! {
            biased;

            _ = shutdown.cancelled() => None,

            result = processor.prepare(first_iteration) => Some(result?),
        };
        let Some(state) = prepared else {
            info!(target = name, "Shutdown requested during intake");
            break;
        };
        first_iteration = false;

        let result = match state {
            Some(s) => processor.process(s).await?,
            None => IterationResult::NoItems,
        };

        let result_type = match result {
            IterationResult::ProcessedItems => IterationResultType::Processed,
            IterationResult::NoItems => IterationResultType::NoItems,
            IterationResult::Aborted => IterationResultType::Aborted,
        };
        emit!(IterationCompleted {
            service,
            result: result_type,
            target: name.to_string(),
        });
        emit!(IterationDuration {
            service,
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        if result == IterationResult::ProcessedItems {
            continue;
        }
        if result == IterationResult::Aborted {
            warn!(target = name, "Iteration aborted, retrying after {:?}", poll_interval);
        } else {
            debug!(target = name, "No new items, waiting {:?}", poll_interval);
        }

        if shutdown
            .run_until_cancelled(tokio::time::sleep(poll_interval))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}
