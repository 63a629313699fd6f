//! Per-message processing pipeline.
//!
//! [`MessageProcessor::process`] is the classification boundary: every
//! error raised by a stage is classified here and converted into an
//! [`Outcome`]. Stages run strictly in order:
//!
//! 1. verify and parse the body into a [`FileRef`]
//! 2. download the object into a temporary file
//! 3. extract text with the [`FileProcessor`]
//! 4. upload the thumbnail, if one was produced
//! 5. index the resulting [`Document`]

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    classify::{classify, ErrorCategory},
    error::{Error, Stage},
    extract::FileProcessor,
    index::SearchIndex,
    message::{Document, Failure, FileRef, Message, Outcome},
    retry::RetryPolicy,
    storage::Storage,
};

/// Prefix of the reason attached to failures escalated by the retry budget.
pub const BUDGET_EXHAUSTED: &str = "retry budget exhausted";

pub struct MessageProcessor {
    storage: Arc<dyn Storage>,
    processor: Arc<dyn FileProcessor>,
    index: Arc<dyn SearchIndex>,
    retry: RetryPolicy,
    download_timeout: Duration,
    processing_timeout: Duration,
    index_timeout: Duration,
    temp_dir: PathBuf,
    default_bucket: Option<String>,
    shutdown: CancellationToken,
}

#[bon::bon]
impl MessageProcessor {
    #[builder]
    pub fn new(
        storage: Arc<dyn Storage>,
        processor: Arc<dyn FileProcessor>,
        index: Arc<dyn SearchIndex>,
        #[builder(default)] retry: RetryPolicy,
        #[builder(default = Duration::from_secs(60))] download_timeout: Duration,
        #[builder(default = Duration::from_secs(180))] processing_timeout: Duration,
        #[builder(default = Duration::from_secs(30))] index_timeout: Duration,
        #[builder(into, default = std::env::temp_dir().join("sluice"))] temp_dir: PathBuf,
        #[builder(into)] default_bucket: Option<String>,
        #[builder(default)] shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            processor,
            index,
            retry,
            download_timeout,
            processing_timeout,
            index_timeout,
            temp_dir,
            default_bucket,
            shutdown,
        }
    }
}

async fn timed<T>(
    stage: Stage,
    limit: Duration,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::timeout(stage, limit))?
}

impl MessageProcessor {
    /// Run the pipeline for one delivery. Never fails: every error becomes a
    /// `Failed` outcome.
    ///
    /// Recoverable and unknown failures are retried in place, with backoff,
    /// up to the policy's inline retry count. What remains is checked against
    /// the lifetime budget and escalated to fatal once it is spent.
    pub async fn process(&self, message: &Message) -> Outcome {
        let span = tracing::info_span!(
            "message",
            id = %message.id(),
            receive_count = message.receive_count()
        );

        async move {
            let mut attempt = 0;
            loop {
                let err = match self.attempt(message).await {
                    Ok(document) => {
                        tracing::info!(
                            document_id = %document.id,
                            chars = document.char_count,
                            "Processed message"
                        );
                        return Outcome::Success(document);
                    }
                    Err(err) => err,
                };

                let category = classify(&err);
                if err.is_resource_exhaustion()
                    || !self.retry.should_retry_locally(category, attempt)
                {
                    return self.settle(message, &err);
                }

                let delay = self.retry.backoff_delay(attempt);
                tracing::warn!(
                    error = %err,
                    %category,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Stage failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("Shutdown during backoff, leaving message for redelivery");
                        return self.settle(message, &err);
                    }
                }
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    /// Final outcome of `err` for this delivery.
    ///
    /// Resource exhaustion is always left for redelivery. Other retryable
    /// failures are escalated to fatal once the lifetime budget is spent.
    pub fn settle(&self, message: &Message, err: &Error) -> Outcome {
        if err.is_resource_exhaustion() {
            tracing::warn!(error = %err, "Host out of resources, leaving message for redelivery");
            return Outcome::Failed(Failure::exhausted(err.to_string()));
        }

        let category = classify(err);
        let settled = self
            .retry
            .settle(category, message.receive_count(), message.age());

        let failure = if settled == category {
            Failure::new(category, err.to_string())
        } else {
            Failure::escalated(format!(
                "{BUDGET_EXHAUSTED} after {} attempts: {err}",
                message.receive_count()
            ))
        };

        match failure.category {
            ErrorCategory::Fatal => {
                tracing::error!(reason = %failure.reason, "Message failed permanently")
            }
            _ => tracing::warn!(
                reason = %failure.reason,
                category = %failure.category,
                "Message failed, leaving for redelivery"
            ),
        }

        Outcome::Failed(failure)
    }

    async fn attempt(&self, message: &Message) -> Result<Document, Error> {
        message.verify_body()?;
        let file = FileRef::from_body(message.body(), self.default_bucket.as_deref())?;

        if !self.processor.supports(&file.key) {
            let extension = file.extension();
            return Err(Error::unsupported(if extension.is_empty() {
                file.key.clone()
            } else {
                extension
            }));
        }

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        // Removed when dropped at the end of the attempt.
        let local = tempfile::Builder::new()
            .prefix("sluice-")
            .suffix(&file.extension())
            .tempfile_in(&self.temp_dir)?;

        timed(
            Stage::Download,
            self.download_timeout,
            self.storage.download(&file.bucket, &file.key, local.path()),
        )
        .await?;

        let extracted = timed(
            Stage::Process,
            self.processing_timeout,
            self.processor.process(local.path()),
        )
        .await?;

        let thumbnail_key = match extracted.thumbnail {
            Some(thumbnail) => self.upload_thumbnail(&file, thumbnail).await,
            None => None,
        };

        let document = Document {
            id: file.document_id(),
            bucket: file.bucket,
            key: file.key,
            char_count: extracted.text.chars().count(),
            text: extracted.text,
            metadata: extracted.metadata,
            thumbnail_key,
            processed_at: Utc::now(),
        };

        let acknowledged = timed(
            Stage::Index,
            self.index_timeout,
            self.index.index_one(&document, &document.id),
        )
        .await?;

        if !acknowledged {
            return Err(Error::index_transient(format!(
                "index did not acknowledge document {}",
                document.id
            )));
        }

        Ok(document)
    }

    // A missing thumbnail never fails the message.
    async fn upload_thumbnail(&self, file: &FileRef, thumbnail: bytes::Bytes) -> Option<String> {
        let key = file.thumbnail_key();
        let upload = timed(
            Stage::Upload,
            self.download_timeout,
            self.storage.upload(thumbnail.into(), &file.bucket, &key),
        )
        .await;

        match upload {
            Ok(()) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, %key, "Thumbnail upload failed");
                None
            }
        }
    }
}
