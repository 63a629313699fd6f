//! Bounded fan-out over one received batch.
//!
//! Each message runs on its own task, gated by a semaphore sized to the
//! worker pool. Tasks share nothing mutable; their outcomes are collected
//! after every task has finished and reduced on the calling task, which is
//! the only place deletes and dead-letter sends are issued.
//!
//! A receipt is only used while its delivery is still invisible to other
//! consumers. Processing is cut off [`RECEIPT_MARGIN`] before the visibility
//! timeout lapses, and a message whose receipt has lapsed by the time its
//! outcome is reduced is neither dead-lettered nor deleted.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    classify::ErrorCategory,
    dlq::DlqRouter,
    error::Error,
    message::{Message, Outcome, ReceiptToken},
    pipeline::MessageProcessor,
    queue::{Queue, MAX_BATCH_SIZE},
};

/// Reason attached to messages skipped because shutdown began before they started.
pub const ABANDONED: &str = "abandoned: shutdown requested before processing started";

/// Reason attached to messages whose visibility timeout lapsed before an outcome was reached.
pub const RECEIPT_LAPSED: &str = "visibility timeout lapsed before processing finished";

/// Slack kept between the last use of a receipt and its visibility deadline.
pub const RECEIPT_MARGIN: Duration = Duration::from_secs(2);

/// One less than the available cores, never below one.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Per-batch counts. Used for logging and reporting only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub received: usize,
    pub succeeded: usize,
    pub fatal: usize,
    /// Recoverable and unknown outcomes, left for redelivery.
    pub recoverable: usize,
    pub dead_lettered: usize,
    pub dead_letter_failures: usize,
    pub deleted: usize,
    pub delete_failures: usize,
    /// Outcomes dropped because the receipt lapsed before they could be acted on.
    pub stale_receipts: usize,
    /// Recoverable outcomes caused by host resource exhaustion.
    pub resource_exhausted: usize,
    pub duration: Duration,
}

pub struct BatchCoordinator<Q> {
    queue: Arc<Q>,
    processor: Arc<MessageProcessor>,
    dlq: DlqRouter<Q>,
    permits: Arc<Semaphore>,
    max_workers: usize,
    shutdown: CancellationToken,
}

#[bon::bon]
impl<Q: Queue> BatchCoordinator<Q> {
    #[builder]
    pub fn new(
        queue: Arc<Q>,
        processor: Arc<MessageProcessor>,
        dlq: DlqRouter<Q>,
        #[builder(default = default_pool_size())] max_workers: usize,
        #[builder(default)] shutdown: CancellationToken,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            queue,
            processor,
            dlq,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            shutdown,
        }
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if e.is_cancelled() {
        return "task was cancelled".to_owned();
    }

    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_owned()
    }
}

impl<Q: Queue> BatchCoordinator<Q> {
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Process and reduce a batch in one call.
    pub async fn run_batch(&self, messages: Vec<Message>) -> BatchResult {
        let started = Instant::now();
        let results = self.dispatch(messages).await;
        self.reduce(results, started).await
    }

    /// Run every message through the pipeline on the worker pool.
    ///
    /// Returns one outcome per input message, in input order. A task that
    /// panics yields an unknown-category failure for its message only.
    pub async fn dispatch(&self, messages: Vec<Message>) -> Vec<(Message, Outcome)> {
        let span = tracing::info_span!("batch", size = messages.len());

        async move {
            let handles: Vec<_> = messages
                .iter()
                .cloned()
                .map(|message| {
                    let permits = self.permits.clone();
                    let processor = self.processor.clone();
                    let shutdown = self.shutdown.clone();

                    tokio::spawn(
                        async move {
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return Outcome::failed(
                                    ErrorCategory::Recoverable,
                                    "worker pool closed",
                                );
                            };
                            if shutdown.is_cancelled() {
                                return Outcome::failed(ErrorCategory::Recoverable, ABANDONED);
                            }
                            if message.receipt_lapses_within(RECEIPT_MARGIN) {
                                tracing::warn!(
                                    message_id = %message.id(),
                                    "Visibility timeout lapsed while waiting for a worker"
                                );
                                return Outcome::failed(ErrorCategory::Recoverable, RECEIPT_LAPSED);
                            }

                            let processing = processor.process(&message);
                            let Some(deadline) = message.visible_until() else {
                                return processing.await;
                            };
                            let cutoff = deadline.checked_sub(RECEIPT_MARGIN).unwrap_or(deadline);

                            match tokio::time::timeout_at(cutoff, processing).await {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    tracing::warn!(
                                        message_id = %message.id(),
                                        "Visibility timeout lapsing, abandoning message"
                                    );
                                    Outcome::failed(ErrorCategory::Recoverable, RECEIPT_LAPSED)
                                }
                            }
                        }
                        .in_current_span(),
                    )
                })
                .collect();

            let mut results = Vec::with_capacity(messages.len());
            for (message, handle) in messages.into_iter().zip(handles) {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => self.crashed(&message, e),
                };
                results.push((message, outcome));
            }

            results
        }
        .instrument(span)
        .await
    }

    fn crashed(&self, message: &Message, e: tokio::task::JoinError) -> Outcome {
        let err = Error::WorkerCrashed {
            message: panic_message(e),
        };
        tracing::error!(message_id = %message.id(), error = %err, "Worker task crashed");

        self.processor.settle(message, &err)
    }

    /// Act on the outcomes of a dispatched batch.
    ///
    /// Success is deleted. Fatal is dead-lettered and deleted only once the
    /// dead-letter send succeeded. Everything else is left untouched, as is
    /// any message whose receipt has lapsed.
    pub async fn reduce(&self, results: Vec<(Message, Outcome)>, started: Instant) -> BatchResult {
        let mut result = BatchResult {
            received: results.len(),
            ..Default::default()
        };
        let mut to_delete: Vec<&Message> = Vec::new();

        for (message, outcome) in &results {
            match outcome {
                Outcome::Success(_) => {
                    result.succeeded += 1;
                    to_delete.push(message);
                }
                Outcome::Failed(failure) if failure.is_fatal() => {
                    result.fatal += 1;
                    if message.receipt_lapses_within(RECEIPT_MARGIN) {
                        result.stale_receipts += 1;
                        tracing::warn!(
                            message_id = %message.id(),
                            "Receipt lapsed, leaving fatal message for its next delivery"
                        );
                        continue;
                    }

                    match self.dlq.send_failure(message, failure).await {
                        Ok(_) => {
                            result.dead_lettered += 1;
                            to_delete.push(message);
                        }
                        Err(_) => result.dead_letter_failures += 1,
                    }
                }
                Outcome::Failed(failure) => {
                    result.recoverable += 1;
                    if failure.resource_exhausted {
                        result.resource_exhausted += 1;
                    }
                }
            }
        }

        // Dead-letter sends take time; check again right before deleting.
        let (live, lapsed): (Vec<&Message>, Vec<&Message>) = to_delete
            .into_iter()
            .partition(|message| !message.receipt_lapses_within(RECEIPT_MARGIN));
        for message in &lapsed {
            tracing::warn!(message_id = %message.id(), "Receipt lapsed, not deleting");
        }
        result.stale_receipts += lapsed.len();

        let tokens: Vec<ReceiptToken> = live.iter().map(|m| m.receipt().clone()).collect();
        let (deleted, failed) = self.delete_all(&tokens).await;
        result.deleted = deleted;
        result.delete_failures = failed;
        result.duration = started.elapsed();

        tracing::info!(
            received = result.received,
            succeeded = result.succeeded,
            fatal = result.fatal,
            recoverable = result.recoverable,
            deleted = result.deleted,
            delete_failures = result.delete_failures,
            stale_receipts = result.stale_receipts,
            duration_ms = result.duration.as_millis() as u64,
            "Batch complete"
        );

        result
    }

    // Chunked to the queue's batch limit. Failed tokens are redelivered naturally.
    async fn delete_all(&self, tokens: &[ReceiptToken]) -> (usize, usize) {
        let mut deleted = 0;
        let mut failed = 0;

        for chunk in tokens.chunks(MAX_BATCH_SIZE) {
            if let [token] = chunk {
                match self.queue.delete(token).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(?token, error = %e, "Failed to delete message");
                    }
                }
                continue;
            }

            match self.queue.delete_batch(chunk).await {
                Ok(outcome) => {
                    deleted += outcome.succeeded.len();
                    failed += outcome.failed.len();
                    for (token, reason) in &outcome.failed {
                        tracing::warn!(?token, %reason, "Failed to delete message");
                    }
                }
                Err(e) => {
                    failed += chunk.len();
                    tracing::warn!(error = %e, count = chunk.len(), "Batch delete failed");
                }
            }
        }

        (deleted, failed)
    }
}
