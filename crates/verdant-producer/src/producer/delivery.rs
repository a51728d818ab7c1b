//! Background delivery task.
//!
//! `emit` hands accepted messages to this task over a bounded channel and
//! returns. The task sends them one at a time, in acceptance order, retrying
//! each with the producer's delivery policy, and reports every outcome
//! through the [`DeliveryCallback`].
//!
//! Shutdown: the producer drops the sender, the task drains what is left in
//! the channel and exits. If draining outlives the close deadline the task is
//! aborted.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use verdant_core::emit;
use verdant_core::envelope::Envelope;
use verdant_core::metrics::events::{DeliveryFailed, InFlightMessages, MessageDelivered};
use verdant_core::retry::{RetryPolicy, retry_with_policy};
use verdant_core::transport::{ProduceRecord, Transport};

use crate::error::TransportError;

/// How a send resolved.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered {
        partition: u32,
        offset: u64,
        /// An earlier attempt had already landed; nothing new was appended.
        duplicate: bool,
    },
    Failed {
        error: TransportError,
    },
}

/// Report for one accepted message, delivered after its send resolves.
#[derive(Debug)]
pub struct DeliveryReceipt {
    pub envelope: Envelope,
    pub sequence: u64,
    /// Attempts made, including the first.
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReceipt {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered { .. })
    }
}

/// Receives delivery receipts. Runs on the delivery task, so it should not block.
pub trait DeliveryCallback: Send + Sync + 'static {
    fn on_delivery(&self, receipt: &DeliveryReceipt);
}

impl<F> DeliveryCallback for F
where
    F: Fn(&DeliveryReceipt) + Send + Sync + 'static,
{
    fn on_delivery(&self, receipt: &DeliveryReceipt) {
        self(receipt)
    }
}

/// Logs each receipt: delivered at debug, failed at error.
pub struct LoggingCallback;

impl DeliveryCallback for LoggingCallback {
    fn on_delivery(&self, receipt: &DeliveryReceipt) {
        match &receipt.outcome {
            DeliveryOutcome::Delivered {
                partition,
                offset,
                duplicate,
            } => debug!(
                schema_id = %receipt.envelope.schema_id,
                partition,
                offset,
                duplicate,
                "Message delivered"
            ),
            DeliveryOutcome::Failed { error } => error!(
                schema_id = %receipt.envelope.schema_id,
                sequence = receipt.sequence,
                attempts = receipt.attempts,
                error = %error,
                "Message delivery failed"
            ),
        }
    }
}

/// A message accepted by `emit`.
pub(crate) struct Pending {
    pub envelope: Envelope,
    pub record: ProduceRecord,
}

/// Handle to the background delivery task.
pub(crate) struct DeliveryTask {
    pub tx: mpsc::Sender<Pending>,
    pub handle: JoinHandle<()>,
}

impl DeliveryTask {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        topic: String,
        policy: RetryPolicy,
        capacity: usize,
        callback: Arc<dyn DeliveryCallback>,
        in_flight: Arc<watch::Sender<usize>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(Self::run(rx, transport, topic, policy, callback, in_flight));
        Self { tx, handle }
    }

    async fn run(
        mut rx: mpsc::Receiver<Pending>,
        transport: Arc<dyn Transport>,
        topic: String,
        policy: RetryPolicy,
        callback: Arc<dyn DeliveryCallback>,
        in_flight: Arc<watch::Sender<usize>>,
    ) {
        while let Some(pending) = rx.recv().await {
            let mut attempts = 0;
            let result = retry_with_policy(
                &policy,
                "transport.send",
                TransportError::is_retriable,
                |attempt| {
                    attempts = attempt;
                    transport.send(&topic, &pending.record)
                },
            )
            .await;

            let outcome = match result {
                Ok(position) => {
                    emit!(MessageDelivered {
                        topic: topic.clone(),
                        attempts,
                    });
                    DeliveryOutcome::Delivered {
                        partition: position.partition,
                        offset: position.offset,
                        duplicate: position.duplicate,
                    }
                }
                Err(e) => {
                    emit!(DeliveryFailed {
                        topic: topic.clone(),
                    });
                    DeliveryOutcome::Failed { error: e.source }
                }
            };

            let receipt = DeliveryReceipt {
                envelope: pending.envelope,
                sequence: pending.record.sequence,
                attempts,
                outcome,
            };
            callback.on_delivery(&receipt);

            in_flight.send_modify(|count| *count = count.saturating_sub(1));
            emit!(InFlightMessages {
                count: *in_flight.borrow(),
                topic: topic.clone(),
            });
        }
        debug!(topic = %topic, "Delivery queue closed");
    }
}
