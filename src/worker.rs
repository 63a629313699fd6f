//! Top-level receive loop.
//!
//! ```text
//! Idle -> Polling -> Idle                                       (empty poll)
//! Idle -> Polling -> BatchReceived -> Dispatching -> Reducing -> Idle
//! any  -> Stopped                                   (after shutdown request)
//! ```
//!
//! Every iteration starts with an admission check against the resource
//! monitor. An unhealthy host gets no receive call at all: the loop
//! mitigates, sleeps and samples again. A batch in which any message ran the
//! host out of resources counts as a failed check for the next iteration. Shutdown is only observed between
//! iterations and while waiting (long poll, backoff); a batch that is being
//! dispatched is always reduced before the loop stops.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::{
    batch::{BatchCoordinator, BatchResult},
    error::Error,
    queue::{Queue, MAX_BATCH_SIZE},
    resources::{ResourceMonitor, Thresholds},
};

/// Empty polls between housekeeping passes.
pub const HOUSEKEEPING_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WorkerState {
    Idle,
    Polling,
    BatchReceived,
    Dispatching,
    Reducing,
    Stopped,
}

/// Totals over the lifetime of a [`WorkerLoop::run`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub polls: u64,
    pub empty_polls: u64,
    pub receive_errors: u64,
    pub admission_denials: u64,
    pub batches: u64,
    pub received: u64,
    pub succeeded: u64,
    pub fatal: u64,
    pub recoverable: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub deleted: u64,
    pub delete_failures: u64,
    pub stale_receipts: u64,
    pub resource_exhausted: u64,
    pub elapsed: Duration,
}

impl WorkerReport {
    fn record(&mut self, batch: &BatchResult) {
        self.batches += 1;
        self.received += batch.received as u64;
        self.succeeded += batch.succeeded as u64;
        self.fatal += batch.fatal as u64;
        self.recoverable += batch.recoverable as u64;
        self.dead_lettered += batch.dead_lettered as u64;
        self.dead_letter_failures += batch.dead_letter_failures as u64;
        self.deleted += batch.deleted as u64;
        self.delete_failures += batch.delete_failures as u64;
        self.stale_receipts += batch.stale_receipts as u64;
        self.resource_exhausted += batch.resource_exhausted as u64;
    }

    /// Messages processed per second of wall-clock time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.received as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct WorkerLoop<Q> {
    queue: Arc<Q>,
    coordinator: BatchCoordinator<Q>,
    monitor: Arc<dyn ResourceMonitor>,
    thresholds: Thresholds,
    max_messages: usize,
    wait_time: Duration,
    visibility_timeout: Duration,
    admission_backoff: Duration,
    poll_error_backoff: Duration,
    shutdown: CancellationToken,
    state: WorkerState,
}

#[bon::bon]
impl<Q: Queue> WorkerLoop<Q> {
    #[builder]
    pub fn new(
        queue: Arc<Q>,
        coordinator: BatchCoordinator<Q>,
        monitor: Arc<dyn ResourceMonitor>,
        #[builder(default)] thresholds: Thresholds,
        #[builder(default = MAX_BATCH_SIZE)] max_messages: usize,
        #[builder(default = Duration::from_secs(20))] wait_time: Duration,
        #[builder(default = Duration::from_secs(1200))] visibility_timeout: Duration,
        #[builder(default = Duration::from_secs(30))] admission_backoff: Duration,
        #[builder(default = Duration::from_secs(5))] poll_error_backoff: Duration,
        #[builder(default)] shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            coordinator,
            monitor,
            thresholds,
            max_messages: max_messages.clamp(1, MAX_BATCH_SIZE),
            wait_time,
            visibility_timeout,
            admission_backoff,
            poll_error_backoff,
            shutdown,
            state: WorkerState::Idle,
        }
    }
}

impl<Q: Queue> WorkerLoop<Q> {
    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::trace!(from = %self.state, to = %next, "Worker state");
            self.state = next;
        }
    }

    // Returns true when shutdown was requested during the pause.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Drive the loop until shutdown is requested.
    pub async fn run(&mut self) -> WorkerReport {
        let started = Instant::now();
        let mut report = WorkerReport::default();
        let mut exhausted_last_batch = false;

        tracing::info!(
            max_workers = self.coordinator.max_workers(),
            max_messages = self.max_messages,
            wait_secs = self.wait_time.as_secs(),
            "Worker started"
        );

        while !self.shutdown.is_cancelled() {
            self.transition(WorkerState::Idle);

            let snapshot = self.monitor.sample();
            let denied = match snapshot.check(&self.thresholds) {
                Err(e) => Some(e),
                Ok(()) if exhausted_last_batch => {
                    Some(Error::exhausted("last batch ran out of host resources"))
                }
                Ok(()) => None,
            };
            exhausted_last_batch = false;

            if let Some(e) = denied {
                report.admission_denials += 1;
                tracing::warn!(
                    error = %e,
                    memory_percent = snapshot.memory_percent,
                    cpu_percent = snapshot.cpu_percent,
                    free_disk_bytes = snapshot.free_disk_bytes,
                    backoff_secs = self.admission_backoff.as_secs(),
                    "Admission denied, pausing intake"
                );

                let purged = self.monitor.mitigate().await;
                tracing::debug!(files = purged.files_removed, bytes = purged.bytes_freed, "Mitigation done");

                if self.pause(self.admission_backoff).await {
                    break;
                }
                continue;
            }

            self.transition(WorkerState::Polling);
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.queue.receive(self.max_messages, self.wait_time, self.visibility_timeout) => received,
            };
            report.polls += 1;

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    report.receive_errors += 1;
                    tracing::error!(error = %e, "Receive failed");
                    if self.pause(self.poll_error_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if messages.is_empty() {
                report.empty_polls += 1;
                if report.empty_polls % HOUSEKEEPING_INTERVAL == 0 {
                    let purged = self.monitor.housekeeping().await;
                    tracing::info!(
                        memory_percent = snapshot.memory_percent,
                        cpu_percent = snapshot.cpu_percent,
                        free_disk_bytes = snapshot.free_disk_bytes,
                        purged_files = purged.files_removed,
                        "Queue idle"
                    );
                }
                continue;
            }

            self.transition(WorkerState::BatchReceived);
            let batch_started = Instant::now();
            tracing::debug!(count = messages.len(), "Received batch");

            self.transition(WorkerState::Dispatching);
            let results = self.coordinator.dispatch(messages).await;

            self.transition(WorkerState::Reducing);
            let batch = self.coordinator.reduce(results, batch_started).await;
            exhausted_last_batch = batch.resource_exhausted > 0;
            report.record(&batch);
        }

        self.transition(WorkerState::Stopped);
        report.elapsed = started.elapsed();

        tracing::info!(
            batches = report.batches,
            processed = report.received,
            succeeded = report.succeeded,
            fatal = report.fatal,
            recoverable = report.recoverable,
            dead_lettered = report.dead_lettered,
            delete_failures = report.delete_failures,
            stale_receipts = report.stale_receipts,
            admission_denials = report.admission_denials,
            messages_per_sec = report.throughput(),
            "Worker stopped"
        );

        report
    }
}
