//! Queue collaborator.
//!
//! This module provides the [`Queue`] trait the worker consumes, plus two
//! implementations:
//!
//! - [`sqs::SqsQueue`], backed by Amazon SQS (or any SQS-compatible endpoint)
//! - [`memory::MemoryQueue`], an in-process queue used for tests and local runs

use std::{collections::HashMap, time::Duration};

use futures_util::future::BoxFuture;

use crate::{
    error::Error,
    message::{Message, ReceiptToken},
};

pub mod memory;
pub mod sqs;

/// Largest batch SQS accepts for `ReceiveMessage` and `DeleteMessageBatch`.
pub const MAX_BATCH_SIZE: usize = 10;

/// Per-token result of a batched delete.
#[derive(Debug, Default)]
pub struct DeleteBatchOutcome {
    pub succeeded: Vec<ReceiptToken>,
    pub failed: Vec<(ReceiptToken, String)>,
}

/// Core trait for the message queue the worker drains.
///
/// Implementations own the source queue; `send` addresses an arbitrary
/// destination (the dead-letter queue).
pub trait Queue: Send + Sync + 'static {
    /// Long-poll for up to `max_count` messages.
    ///
    /// Returns an empty batch when nothing arrived within `wait`. Received
    /// messages stay hidden from other consumers for `visibility_timeout`.
    fn receive(
        &self,
        max_count: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>>;

    /// Delete a single message.
    fn delete<'a>(&'a self, token: &'a ReceiptToken) -> BoxFuture<'a, Result<(), Error>>;

    /// Delete up to [`MAX_BATCH_SIZE`] messages in one call.
    fn delete_batch<'a>(
        &'a self,
        tokens: &'a [ReceiptToken],
    ) -> BoxFuture<'a, Result<DeleteBatchOutcome, Error>>;

    /// Send a message to `destination`, returning the new message id.
    fn send<'a>(
        &'a self,
        destination: &'a str,
        body: String,
        attributes: HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String, Error>>;
}
