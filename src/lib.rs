use std::{future::Future, sync::Arc};

use config::Config;
use error::Error;
use queue::Queue;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use crate::{
    batch::BatchCoordinator,
    dlq::{DeadLetterInspector, DlqRouter},
    extract::text::TextExtractor,
    index::jsonl::JsonlIndex,
    pipeline::MessageProcessor,
    resources::SysinfoMonitor,
    storage::local::LocalStorage,
    worker::{WorkerLoop, WorkerReport},
};

pub mod batch;
pub mod classify;
pub mod config;
pub mod dlq;
pub mod error;
pub mod extract;
pub mod index;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod resources;
pub mod retry;
pub mod storage;
pub mod worker;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "SLUICE_LOG";

fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown requested, finishing in-flight batch");
    token.cancel();
}

/// Returns a builder for the worker process.
///
/// Initializes logging, loads the configuration and builds the queue with
/// `queue_factory` before the first poll; any failure up to that point is
/// returned without touching the queue. Runs until SIGINT or SIGTERM.
#[bon::builder(finish_fn = start)]
pub async fn run<K, F, Q>(queue_factory: K) -> eyre::Result<WorkerReport>
where
    K: FnOnce(&Config) -> F,
    F: Future<Output = Result<Q, Error>>,
    Q: Queue,
{
    init_tracing()?;

    let config = Config::load().inspect_err(|e| {
        tracing::error!(error = %e, "Refusing to start");
    })?;

    tracing::info!(
        queue_url = %config.queue_url,
        dead_letter_destination = %config.dead_letter_destination,
        "Configuration loaded"
    );

    let queue = Arc::new(queue_factory(&config).await?);
    tokio::fs::create_dir_all(&config.temp_dir).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let processor = MessageProcessor::builder()
        .storage(Arc::new(LocalStorage::new(config.storage_root.clone())))
        .processor(Arc::new(TextExtractor::new()))
        .index(Arc::new(JsonlIndex::new(config.index_path.clone())))
        .retry(config.retry_policy())
        .download_timeout(config.download_timeout())
        .processing_timeout(config.processing_timeout())
        .index_timeout(config.index_timeout())
        .temp_dir(config.temp_dir.clone())
        .maybe_default_bucket(config.default_bucket.clone())
        .shutdown(shutdown.clone())
        .build();

    let dlq = DlqRouter::builder()
        .queue(queue.clone())
        .destination(config.dead_letter_destination.clone())
        .worker_id(config.worker_id())
        .maybe_default_bucket(config.default_bucket.clone())
        .build();

    let coordinator = BatchCoordinator::builder()
        .queue(queue.clone())
        .processor(Arc::new(processor))
        .dlq(dlq)
        .max_workers(config.max_workers())
        .shutdown(shutdown.clone())
        .build();

    let monitor = SysinfoMonitor::builder()
        .temp_dir(config.temp_dir.clone())
        .temp_file_max_age(config.temp_file_max_age())
        .build();

    let mut worker = WorkerLoop::builder()
        .queue(queue)
        .coordinator(coordinator)
        .monitor(Arc::new(monitor))
        .thresholds(config.thresholds())
        .max_messages(config.max_messages_per_batch)
        .wait_time(config.wait_time())
        .visibility_timeout(config.visibility_timeout())
        .admission_backoff(config.admission_backoff())
        .poll_error_backoff(config.poll_error_backoff())
        .shutdown(shutdown)
        .build();

    Ok(worker.run().await)
}

/// One-shot passes over the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeadLetterCommand {
    /// Count dead-lettered messages by category.
    Summarize,
    /// Send retryable messages back to the source queue.
    Redrive,
}

/// Returns a builder for a dead-letter maintenance pass.
///
/// `queue_factory` must return a handle whose source is the dead-letter
/// queue; redriven messages are sent to the configured source queue.
#[bon::builder(finish_fn = start)]
pub async fn dead_letters<K, F, Q>(
    command: DeadLetterCommand,
    queue_factory: K,
    #[builder(default = 100)] max_messages: usize,
) -> eyre::Result<()>
where
    K: FnOnce(&Config) -> F,
    F: Future<Output = Result<Q, Error>>,
    Q: Queue,
{
    init_tracing()?;

    let config = Config::load().inspect_err(|e| {
        tracing::error!(error = %e, "Refusing to start");
    })?;

    let inspector = DeadLetterInspector::builder()
        .dead_letters(Arc::new(queue_factory(&config).await?))
        .source_url(config.queue_url.clone())
        .build();

    match command {
        DeadLetterCommand::Summarize => {
            let summary = inspector.summarize(max_messages).await?;
            for (category, count) in &summary.by_category {
                tracing::info!(%category, count, "Dead-lettered messages");
            }
        }
        DeadLetterCommand::Redrive => {
            inspector.redrive(max_messages).await?;
        }
    }

    Ok(())
}
