//! Messages, payload references and per-attempt outcomes.
//!
//! A [`Message`] is created by the queue and is read-only here. Processing
//! one delivery produces exactly one [`Outcome`], which decides what happens
//! to the message's [`ReceiptToken`]:
//!
//! - `Success`: the token is consumed by a delete
//! - `Failed` with a fatal category: dead-lettered, then deleted
//! - `Failed` otherwise: the token is dropped and the queue redelivers the
//!   message once its visibility timeout lapses
//!
//! A token is only good until the visibility timeout of its delivery lapses.
//! After that the queue may have handed the message to another consumer with
//! a new token, so a late outcome is neither deleted nor dead-lettered.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::{classify::ErrorCategory, error::Error};

/// Handle required to delete a received message.
///
/// Tokens are issued per delivery; a redelivered message carries a new one
/// and the old one must not be used again.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReceiptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Receipt handles are long opaque blobs; the prefix is enough to correlate.
        let prefix: String = self.0.chars().take(12).collect();
        write!(f, "ReceiptToken({prefix}…)")
    }
}

/// A single delivery of a queued work item.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    body: String,
    receipt: ReceiptToken,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
    attributes: HashMap<String, String>,
    body_md5: Option<String>,
    visible_until: Option<Instant>,
}

#[bon::bon]
impl Message {
    #[builder]
    pub fn new(
        #[builder(into)] id: String,
        #[builder(into)] body: String,
        receipt: ReceiptToken,
        #[builder(default = 1)] receive_count: u32,
        #[builder(default = Utc::now())] enqueued_at: DateTime<Utc>,
        #[builder(default)] attributes: HashMap<String, String>,
        // Hex MD5 digest of the body as reported by the queue.
        body_md5: Option<String>,
        // When the queue makes this delivery visible to other consumers again.
        visible_until: Option<Instant>,
    ) -> Self {
        Self {
            id,
            body,
            receipt,
            receive_count: receive_count.max(1),
            enqueued_at,
            attributes,
            body_md5,
            visible_until,
        }
    }
}

impl Message {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn receipt(&self) -> &ReceiptToken {
        &self.receipt
    }

    /// Approximate number of times the queue has delivered this message,
    /// including this delivery. Advisory only.
    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn visible_until(&self) -> Option<Instant> {
        self.visible_until
    }

    /// Whether the receipt lapses within `margin` from now. A delivery with
    /// no known deadline never lapses.
    pub fn receipt_lapses_within(&self, margin: Duration) -> bool {
        self.visible_until
            .is_some_and(|deadline| Instant::now() + margin >= deadline)
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.enqueued_at).to_std().unwrap_or_default()
    }

    /// Check the body against the digest the queue reported, if any.
    pub fn verify_body(&self) -> Result<(), Error> {
        let Some(expected) = &self.body_md5 else {
            return Ok(());
        };

        let actual = format!("{:x}", md5::compute(self.body.as_bytes()));
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "body digest mismatch: expected {expected}, got {actual}"
            )))
        }
    }
}

/// Location of the payload a message refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Deserialize)]
struct S3Notification {
    #[serde(rename = "Records")]
    records: Vec<S3Record>,
}

#[derive(Deserialize)]
struct S3Record {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
}

#[derive(Deserialize)]
struct EventBridgeEvent {
    detail: S3Entity,
}

#[derive(Deserialize)]
struct CustomPayload {
    bucket: Option<String>,
    key: String,
}

impl FileRef {
    /// Parse a message body.
    ///
    /// Accepts S3 event notifications, EventBridge S3 events and the custom
    /// `{"bucket": .., "key": ..}` shape. A custom payload without a bucket
    /// falls back to `default_bucket`.
    pub fn from_body(body: &str, default_bucket: Option<&str>) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(body)?;

        let file = if value.get("Records").is_some() {
            let notification: S3Notification = serde_json::from_value(value)?;
            let record = notification
                .records
                .into_iter()
                .next()
                .ok_or_else(|| Error::validation("S3 notification has no records"))?;

            // Keys in S3 notifications are form-encoded.
            let key = urlencoding::decode(&record.s3.object.key.replace('+', " "))
                .map_err(|e| Error::validation(format!("object key is not valid UTF-8: {e}")))?
                .into_owned();

            Self {
                bucket: record.s3.bucket.name,
                key,
            }
        } else if value.get("detail").is_some() {
            let event: EventBridgeEvent = serde_json::from_value(value)?;
            Self {
                bucket: event.detail.bucket.name,
                key: event.detail.object.key,
            }
        } else {
            let payload: CustomPayload = serde_json::from_value(value)?;
            let bucket = payload
                .bucket
                .or_else(|| default_bucket.map(str::to_owned))
                .ok_or_else(|| Error::validation("payload has no bucket and no default bucket is configured"))?;

            Self {
                bucket,
                key: payload.key,
            }
        };

        if file.bucket.is_empty() || file.key.is_empty() {
            return Err(Error::validation("bucket and key must not be empty"));
        }

        Ok(file)
    }

    /// Stable document id: hex SHA-256 of `bucket/key`.
    pub fn document_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Lowercased extension including the dot, or an empty string.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.key)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }

    pub fn thumbnail_key(&self) -> String {
        format!("thumbnails/{}.jpg", self.key)
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Searchable representation of a processed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub text: String,
    pub char_count: usize,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub thumbnail_key: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Classified failure of one attempt.
///
/// `retryable` describes the cause, not the disposition: a transient failure
/// escalated to fatal by the retry budget is fatal but still retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub category: ErrorCategory,
    pub reason: String,
    pub retryable: bool,
    /// The host ran out of resources. Always recoverable.
    pub resource_exhausted: bool,
}

impl Failure {
    pub fn new(category: ErrorCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
            retryable: category.is_retryable(),
            resource_exhausted: false,
        }
    }

    /// A transient failure that ran out of retry budget.
    pub fn escalated(reason: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Fatal,
            reason: reason.into(),
            retryable: true,
            resource_exhausted: false,
        }
    }

    pub fn exhausted(reason: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Recoverable,
            reason: reason.into(),
            retryable: true,
            resource_exhausted: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category == ErrorCategory::Fatal
    }
}

/// Result of processing one delivery. Exactly one is produced per attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Document),
    Failed(Failure),
}

impl Outcome {
    pub fn failed(category: ErrorCategory, reason: impl Into<String>) -> Self {
        Self::Failed(Failure::new(category, reason))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Success and fatal failures consume the receipt token.
    pub fn consumes_receipt(&self) -> bool {
        match self {
            Self::Success(_) => true,
            Self::Failed(failure) => failure.is_fatal(),
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Success(_) => None,
            Self::Failed(failure) => Some(failure.category),
        }
    }
}
