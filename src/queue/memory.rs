//! In-process implementation of the queue collaborator.
//!
//! Mirrors the SQS semantics the worker depends on: every receive issues a
//! fresh receipt token and bumps the receive count, received messages are
//! hidden until their visibility timeout lapses, and deleting with a stale
//! token fails. Calls are recorded so tests can assert on them.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::{distributions::Alphanumeric, Rng};
use tokio::{sync::Notify, time::Instant};

use super::{DeleteBatchOutcome, Queue, MAX_BATCH_SIZE};
use crate::{
    error::Error,
    message::{Message, ReceiptToken},
};

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: String,
    attributes: HashMap<String, String>,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlight {
    message: Stored,
    visible_at: Instant,
}

/// A message that was passed to [`Queue::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub destination: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Stored>,
    in_flight: HashMap<ReceiptToken, InFlight>,
    next_id: u64,
    receive_calls: usize,
    deleted: Vec<String>,
    sent: Vec<SentMessage>,
    fail_sends: bool,
}

impl State {
    // Expired deliveries go back to the front of the queue.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<ReceiptToken> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.visible_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(flight) = self.in_flight.remove(&token) {
                self.ready.push_front(flight.message);
            }
        }
    }

    fn take_ready(&mut self, max_count: usize, visibility_timeout: Duration) -> Vec<Message> {
        let now = Instant::now();
        let mut batch = Vec::new();

        while batch.len() < max_count {
            let Some(mut stored) = self.ready.pop_front() else {
                break;
            };
            stored.receive_count += 1;

            let token = ReceiptToken::new(generate_receipt());
            batch.push(
                Message::builder()
                    .id(stored.id.clone())
                    .body(stored.body.clone())
                    .receipt(token.clone())
                    .receive_count(stored.receive_count)
                    .enqueued_at(stored.enqueued_at)
                    .attributes(stored.attributes.clone())
                    .visible_until(now + visibility_timeout)
                    .build(),
            );

            self.in_flight.insert(
                token,
                InFlight {
                    message: stored,
                    visible_at: now + visibility_timeout,
                },
            );
        }

        batch
    }

    fn delete(&mut self, token: &ReceiptToken) -> Result<(), Error> {
        match self.in_flight.remove(token) {
            Some(flight) => {
                self.deleted.push(flight.message.id);
                Ok(())
            }
            None => Err(Error::validation(format!(
                "receipt handle {token:?} is invalid or expired"
            ))),
        }
    }
}

fn generate_receipt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Thread-safe in-memory queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    arrivals: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a message, returning its id.
    pub fn push(&self, body: impl Into<String>) -> String {
        self.push_with(body, HashMap::new(), Utc::now())
    }

    pub fn push_with(
        &self,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
        enqueued_at: DateTime<Utc>,
    ) -> String {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = format!("msg-{}", state.next_id);
            state.ready.push_back(Stored {
                id: id.clone(),
                body: body.into(),
                attributes,
                receive_count: 0,
                enqueued_at,
            });
            id
        };
        self.arrivals.notify_waiters();
        id
    }

    /// Make every subsequent `send` fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Make every in-flight message visible again immediately.
    pub fn expire_in_flight(&self) {
        let mut state = self.state();
        let now = Instant::now();
        for flight in state.in_flight.values_mut() {
            flight.visible_at = now;
        }
        state.requeue_expired(now);
    }

    pub fn receive_calls(&self) -> usize {
        self.state().receive_calls
    }

    /// Ids of deleted messages, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<SentMessage> {
        self.state()
            .sent
            .iter()
            .filter(|sent| sent.destination == destination)
            .cloned()
            .collect()
    }

    pub fn ready_len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }
}

impl Queue for MemoryQueue {
    fn receive(
        &self,
        max_count: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        Box::pin(async move {
            let max_count = max_count.clamp(1, MAX_BATCH_SIZE);
            let deadline = Instant::now() + wait;

            {
                let mut state = self.state();
                state.receive_calls += 1;
            }

            loop {
                // Register interest before checking so a push in between is not missed.
                let arrived = self.arrivals.notified();

                {
                    let mut state = self.state();
                    state.requeue_expired(Instant::now());
                    let batch = state.take_ready(max_count, visibility_timeout);
                    if !batch.is_empty() {
                        return Ok(batch);
                    }
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }

                let next_expiry = self
                    .state()
                    .in_flight
                    .values()
                    .map(|flight| flight.visible_at)
                    .min()
                    .unwrap_or(deadline)
                    .min(deadline);

                tokio::select! {
                    _ = arrived => {}
                    _ = tokio::time::sleep_until(next_expiry) => {}
                }
            }
        })
    }

    fn delete<'a>(&'a self, token: &'a ReceiptToken) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move { self.state().delete(token) })
    }

    fn delete_batch<'a>(
        &'a self,
        tokens: &'a [ReceiptToken],
    ) -> BoxFuture<'a, Result<DeleteBatchOutcome, Error>> {
        Box::pin(async move {
            if tokens.len() > MAX_BATCH_SIZE {
                return Err(Error::validation(format!(
                    "batch of {} exceeds the maximum of {MAX_BATCH_SIZE}",
                    tokens.len()
                )));
            }

            let mut state = self.state();
            let mut outcome = DeleteBatchOutcome::default();
            for token in tokens {
                match state.delete(token) {
                    Ok(()) => outcome.succeeded.push(token.clone()),
                    Err(e) => outcome.failed.push((token.clone(), e.to_string())),
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
            let mut state = self.state();
            if state.fail_sends {
                return Err(Error::transport(eyre::eyre!(
                    "connection reset sending to {destination}"
                )));
            }

            state.next_id += 1;
            let id = format!("sent-{}", state.next_id);
            state.sent.push(SentMessage {
                destination: destination.to_owned(),
                body,
                attributes,
            });

            Ok(id)
        })
    }
}
