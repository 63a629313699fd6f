//! Dead-letter routing and maintenance.
//!
//! A fatal message is copied to the dead-letter destination together with
//! enough context to diagnose it later. The router never deletes anything;
//! the batch coordinator deletes the source message only after a send here
//! has succeeded.
//!
//! [`DeadLetterInspector`] works the other side: it summarizes what is
//! sitting in the dead-letter queue and redrives retryable records back to
//! the source queue.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    classify::ErrorCategory,
    error::Error,
    message::{Failure, FileRef, Message, ReceiptToken},
    queue::{Queue, MAX_BATCH_SIZE},
};

/// Longest failure reason carried in a message attribute.
pub const MAX_REASON_ATTRIBUTE_LEN: usize = 256;

pub const ATTR_FAILURE_REASON: &str = "FailureReason";
pub const ATTR_ERROR_CATEGORY: &str = "ErrorCategory";
pub const ATTR_ATTEMPT_COUNT: &str = "AttemptCount";
pub const ATTR_ORIGINAL_MESSAGE_ID: &str = "OriginalMessageId";
pub const ATTR_FILE_KEY: &str = "FileKey";
pub const ATTR_FAILED_AT: &str = "FailedAt";
pub const ATTR_RETRYABLE: &str = "Retryable";
pub const ATTR_REDRIVE_COUNT: &str = "RedriveCount";
pub const ATTR_REDRIVEN_AT: &str = "RedrivenAt";

/// Body of a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_message_id: String,
    pub original_body: String,
    pub failure_reason: String,
    pub error_category: ErrorCategory,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    /// Whether the cause was transient. Escalated failures are fatal but retryable.
    #[serde(default)]
    pub retryable: bool,
    /// How many times this message has already been redriven.
    #[serde(default)]
    pub redrive_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub worker_id: String,
}

impl DeadLetterRecord {
    fn attributes(&self) -> HashMap<String, String> {
        let mut attributes = HashMap::from([
            (
                ATTR_FAILURE_REASON.to_owned(),
                truncate(&self.failure_reason, MAX_REASON_ATTRIBUTE_LEN),
            ),
            (ATTR_ERROR_CATEGORY.to_owned(), self.error_category.to_string()),
            (ATTR_ATTEMPT_COUNT.to_owned(), self.attempt_count.to_string()),
            (
                ATTR_ORIGINAL_MESSAGE_ID.to_owned(),
                self.original_message_id.clone(),
            ),
            (ATTR_FAILED_AT.to_owned(), self.failed_at.to_rfc3339()),
            (ATTR_RETRYABLE.to_owned(), self.retryable.to_string()),
            (ATTR_REDRIVE_COUNT.to_owned(), self.redrive_count.to_string()),
        ]);

        if let Some(key) = &self.key {
            attributes.insert(ATTR_FILE_KEY.to_owned(), key.clone());
        }

        attributes
    }
}

// Truncate on a char boundary.
fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

pub struct DlqRouter<Q> {
    queue: Arc<Q>,
    destination: String,
    worker_id: String,
    default_bucket: Option<String>,
}

#[bon::bon]
impl<Q: Queue> DlqRouter<Q> {
    #[builder]
    pub fn new(
        queue: Arc<Q>,
        #[builder(into)] destination: String,
        #[builder(into)] worker_id: String,
        #[builder(into)] default_bucket: Option<String>,
    ) -> Self {
        Self {
            queue,
            destination,
            worker_id,
            default_bucket,
        }
    }
}

impl<Q: Queue> DlqRouter<Q> {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn record(
        &self,
        message: &Message,
        reason: &str,
        category: ErrorCategory,
        attempt_count: u32,
    ) -> DeadLetterRecord {
        let file = FileRef::from_body(message.body(), self.default_bucket.as_deref()).ok();
        let redrive_count = message
            .attributes()
            .get(ATTR_REDRIVE_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);

        DeadLetterRecord {
            original_message_id: message.id().to_owned(),
            original_body: message.body().to_owned(),
            failure_reason: reason.to_owned(),
            error_category: category,
            attempt_count,
            failed_at: Utc::now(),
            retryable: category.is_retryable(),
            redrive_count,
            bucket: file.as_ref().map(|f| f.bucket.clone()),
            key: file.map(|f| f.key),
            worker_id: self.worker_id.clone(),
        }
    }

    /// Send an enriched copy of `message` to the dead-letter destination.
    ///
    /// Returns the id of the dead-letter message. On error nothing was
    /// sent and the source message must be left in place.
    pub async fn send_failure(&self, message: &Message, failure: &Failure) -> Result<String, Error> {
        let mut record = self.record(
            message,
            &failure.reason,
            failure.category,
            message.receive_count(),
        );
        record.retryable = failure.retryable;
        self.send(message, record).await
    }

    async fn send(&self, message: &Message, record: DeadLetterRecord) -> Result<String, Error> {
        let attributes = record.attributes();
        let body = serde_json::to_string(&record)?;

        let dead_letter_id = self
            .queue
            .send(&self.destination, body, attributes)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    message_id = %message.id(),
                    error = %e,
                    "Failed to dead-letter message; leaving it for redelivery"
                );
            })?;

        tracing::warn!(
            message_id = %message.id(),
            %dead_letter_id,
            category = %record.error_category,
            attempt_count = record.attempt_count,
            retryable = record.retryable,
            reason = %record.failure_reason,
            "Dead-lettered message"
        );

        Ok(dead_letter_id)
    }
}

/// What is sitting in the dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterSummary {
    pub examined: usize,
    pub by_category: HashMap<ErrorCategory, usize>,
    pub retryable: usize,
    /// Messages whose body is not a dead-letter record.
    pub unreadable: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedriveReport {
    pub examined: usize,
    pub redriven: usize,
    /// Not retryable, too recent, or over the redrive limit.
    pub skipped: usize,
    pub unreadable: usize,
    pub send_failures: usize,
    pub delete_failures: usize,
}

/// Reads the dead-letter queue.
///
/// `dead_letters` must be a queue handle whose source is the dead-letter
/// queue itself. Nothing is deleted except records that were sent back to
/// `source_url`; everything else becomes visible again after `visibility`.
pub struct DeadLetterInspector<D> {
    dead_letters: Arc<D>,
    source_url: String,
    visibility: Duration,
    wait: Duration,
    redrive_limit: u32,
    min_age: Duration,
}

#[bon::bon]
impl<D: Queue> DeadLetterInspector<D> {
    #[builder]
    pub fn new(
        dead_letters: Arc<D>,
        #[builder(into)] source_url: String,
        #[builder(default = Duration::from_secs(30))] visibility: Duration,
        #[builder(default = Duration::from_secs(2))] wait: Duration,
        #[builder(default = 3)] redrive_limit: u32,
        /// Records younger than this are left alone.
        #[builder(default = Duration::from_secs(300))]
        min_age: Duration,
    ) -> Self {
        Self {
            dead_letters,
            source_url,
            visibility,
            wait,
            redrive_limit,
            min_age,
        }
    }
}

impl<D: Queue> DeadLetterInspector<D> {
    // Receives until `max_messages` were seen or the queue comes back empty.
    async fn drain(&self, max_messages: usize) -> Result<Vec<Message>, Error> {
        let mut messages = Vec::new();

        while messages.len() < max_messages {
            let want = (max_messages - messages.len()).min(MAX_BATCH_SIZE);
            let batch = self
                .dead_letters
                .receive(want, self.wait, self.visibility)
                .await?;
            if batch.is_empty() {
                break;
            }
            messages.extend(batch);
        }

        Ok(messages)
    }

    /// Count dead-lettered messages by category. Never deletes.
    pub async fn summarize(&self, max_messages: usize) -> Result<DeadLetterSummary, Error> {
        let messages = self.drain(max_messages).await?;
        let mut summary = DeadLetterSummary {
            examined: messages.len(),
            ..Default::default()
        };

        for message in &messages {
            let Ok(record) = serde_json::from_str::<DeadLetterRecord>(message.body()) else {
                summary.unreadable += 1;
                continue;
            };
            *summary.by_category.entry(record.error_category).or_default() += 1;
            if record.retryable {
                summary.retryable += 1;
            }
        }

        tracing::info!(
            examined = summary.examined,
            retryable = summary.retryable,
            unreadable = summary.unreadable,
            "Dead-letter summary"
        );

        Ok(summary)
    }

    pub fn should_redrive(&self, record: &DeadLetterRecord) -> bool {
        let age = (Utc::now() - record.failed_at).to_std().unwrap_or_default();
        record.retryable && record.redrive_count < self.redrive_limit && age >= self.min_age
    }

    /// Send retryable records back to the source queue and delete them from
    /// the dead-letter queue.
    ///
    /// A record is deleted only after its resend succeeded.
    pub async fn redrive(&self, max_messages: usize) -> Result<RedriveReport, Error> {
        let messages = self.drain(max_messages).await?;
        let mut report = RedriveReport {
            examined: messages.len(),
            ..Default::default()
        };
        let mut redriven: Vec<ReceiptToken> = Vec::new();

        for message in &messages {
            let Ok(record) = serde_json::from_str::<DeadLetterRecord>(message.body()) else {
                report.unreadable += 1;
                continue;
            };
            if !self.should_redrive(&record) {
                report.skipped += 1;
                continue;
            }

            let attributes = HashMap::from([
                (
                    ATTR_REDRIVE_COUNT.to_owned(),
                    (record.redrive_count + 1).to_string(),
                ),
                (ATTR_REDRIVEN_AT.to_owned(), Utc::now().to_rfc3339()),
                (
                    ATTR_ORIGINAL_MESSAGE_ID.to_owned(),
                    record.original_message_id.clone(),
                ),
            ]);

            match self
                .dead_letters
                .send(&self.source_url, record.original_body.clone(), attributes)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        original_message_id = %record.original_message_id,
                        redrive_count = record.redrive_count + 1,
                        "Redrove dead-lettered message"
                    );
                    redriven.push(message.receipt().clone());
                }
                Err(e) => {
                    report.send_failures += 1;
                    tracing::warn!(
                        original_message_id = %record.original_message_id,
                        error = %e,
                        "Failed to redrive message"
                    );
                }
            }
        }

        for chunk in redriven.chunks(MAX_BATCH_SIZE) {
            match self.dead_letters.delete_batch(chunk).await {
                Ok(outcome) => {
                    report.redriven += outcome.succeeded.len();
                    report.delete_failures += outcome.failed.len();
                }
                Err(e) => {
                    report.delete_failures += chunk.len();
                    tracing::warn!(error = %e, count = chunk.len(), "Failed to delete redriven records");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            redriven = report.redriven,
            skipped = report.skipped,
            "Redrive complete"
        );

        Ok(report)
    }
}
