//! Amazon SQS implementation of the queue collaborator.

use std::{collections::HashMap, time::Duration};

use aws_sdk_sqs::{
    error::{ProvideErrorMetadata, SdkError},
    types::{DeleteMessageBatchRequestEntry, MessageAttributeValue, MessageSystemAttributeName},
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use super::{DeleteBatchOutcome, Queue, MAX_BATCH_SIZE};
use crate::{
    error::Error,
    message::{Message, ReceiptToken},
};

/// SQS-backed queue bound to one source queue URL.
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Build a client from the ambient AWS configuration (env, profile, IMDS).
    pub async fn from_env(queue_url: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_sqs::Client::new(&config), queue_url)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

fn seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

/// Map an SDK failure onto the crate taxonomy.
fn sdk_error<E>(operation: &str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(context) = &err {
        let status = context.raw().status().as_u16();
        let code = context.err().code().unwrap_or("Unknown");
        let message = format!(
            "{operation}: {code}: {}",
            context.err().message().unwrap_or("no message")
        );

        return if code.contains("AccessDenied") || code.contains("NotAuthorized") {
            Error::AccessDenied { resource: message }
        } else if code.contains("NonExistentQueue") || code.contains("QueueDoesNotExist") {
            Error::NotFound { resource: message }
        } else if code.contains("Throttl") || code.contains("OverLimit") || status == 429 {
            Error::Throttled { message }
        } else if code.contains("ReceiptHandleIsInvalid") || code.contains("InvalidParameter") {
            Error::Validation { message }
        } else {
            Error::Upstream { status, message }
        };
    }

    let message = format!("{operation}: {err}");
    let source = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    )
    .then(|| eyre::Report::new(err));

    Error::Transport { message, source }
}

fn convert(message: aws_sdk_sqs::types::Message, visible_until: Instant) -> Option<Message> {
    let (Some(id), Some(receipt)) = (message.message_id, message.receipt_handle) else {
        tracing::warn!("Dropping message without id or receipt handle");
        return None;
    };

    let system = message.attributes.unwrap_or_default();
    let receive_count = system
        .get(&MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(1);
    let enqueued_at = system
        .get(&MessageSystemAttributeName::SentTimestamp)
        .and_then(|millis| millis.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let attributes = message
        .message_attributes
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.string_value.map(|v| (k, v)))
        .collect::<HashMap<_, _>>();

    Some(
        Message::builder()
            .id(id)
            .body(message.body.unwrap_or_default())
            .receipt(ReceiptToken::new(receipt))
            .receive_count(receive_count)
            .enqueued_at(enqueued_at)
            .attributes(attributes)
            .maybe_body_md5(message.md5_of_body)
            .visible_until(visible_until)
            .build(),
    )
}

impl Queue for SqsQueue {
    fn receive(
        &self,
        max_count: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        Box::pin(async move {
            // Taken before the request so the deadline errs on the early side.
            let visible_until = Instant::now() + visibility_timeout;
            let output = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max_count.clamp(1, MAX_BATCH_SIZE) as i32)
                .wait_time_seconds(seconds(wait))
                .visibility_timeout(seconds(visibility_timeout))
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .message_system_attribute_names(MessageSystemAttributeName::SentTimestamp)
                .message_attribute_names("All")
                .send()
                .await
                .map_err(|e| sdk_error("ReceiveMessage", e))?;

            Ok(output
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|message| convert(message, visible_until))
                .collect())
        })
    }

    fn delete<'a>(&'a self, token: &'a ReceiptToken) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.client
                .delete_message()
                .queue_url(&self.queue_url)
                .receipt_handle(token.as_str())
                .send()
                .await
                .map_err(|e| sdk_error("DeleteMessage", e))?;

            Ok(())
        })
    }

    fn delete_batch<'a>(
        &'a self,
        tokens: &'a [ReceiptToken],
    ) -> BoxFuture<'a, Result<DeleteBatchOutcome, Error>> {
        Box::pin(async move {
            if tokens.is_empty() {
                return Ok(DeleteBatchOutcome::default());
            }
            if tokens.len() > MAX_BATCH_SIZE {
                return Err(Error::validation(format!(
                    "batch of {} exceeds the maximum of {MAX_BATCH_SIZE}",
                    tokens.len()
                )));
            }

            // Entry ids are indices into `tokens`.
            let entries = tokens
                .iter()
                .enumerate()
                .map(|(i, token)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(i.to_string())
                        .receipt_handle(token.as_str())
                        .build()
                        .map_err(|e| Error::validation(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let output = self
                .client
                .delete_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| sdk_error("DeleteMessageBatch", e))?;

            let token_for = |id: &str| id.parse::<usize>().ok().and_then(|i| tokens.get(i)).cloned();

            let mut outcome = DeleteBatchOutcome::default();
            for entry in output.successful() {
                if let Some(token) = token_for(entry.id()) {
                    outcome.succeeded.push(token);
                }
            }
            for entry in output.failed() {
                if let Some(token) = token_for(entry.id()) {
                    let reason = format!(
                        "{}: {}",
                        entry.code(),
                        entry.message().unwrap_or("no message")
                    );
                    outcome.failed.push((token, reason));
                }
            }

            Ok(outcome)
        })
    }

    fn send<'a>(
        &'a self,
        destination: &'a str,
        body: String,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String, Error>> {
        Box::pin(async move {
            let attributes = attributes
                .into_iter()
                .map(|(k, v)| {
                    MessageAttributeValue::builder()
                        .data_type("String")
                        .string_value(v)
                        .build()
                        .map(|value| (k, value))
                        .map_err(|e| Error::validation(e.to_string()))
                })
                .collect::<Result<HashMap<_, _>, _>>()?;

            let output = self
                .client
                .send_message()
                .queue_url(destination)
                .message_body(body)
                .set_message_attributes(Some(attributes))
                .send()
                .await
                .map_err(|e| sdk_error("SendMessage", e))?;

            Ok(output.message_id.unwrap_or_default())
        })
    }
}
