//! Retry and backoff policy.
//!
//! The policy never schedules redelivery itself; the queue's visibility
//! timeout does that. It answers two questions:
//!
//! - should a failed stage be retried again *inside* the current invocation
//!   (and how long to sleep before doing so), and
//! - has a message used up its lifetime budget, so that a recoverable failure
//!   must be escalated to [`ErrorCategory::Fatal`] instead of being left for
//!   redelivery.

use std::time::Duration;

use rand::Rng;

use crate::classify::ErrorCategory;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
    inline_retries: u32,
    attempt_budget: u32,
    time_budget: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon::bon]
impl RetryPolicy {
    #[builder]
    pub fn new(
        #[builder(default = Duration::from_secs(2))] base_delay: Duration,
        #[builder(default = Duration::from_secs(60))] max_delay: Duration,
        #[builder(default = 0.25)] jitter_fraction: f64,
        #[builder(default = 2)] inline_retries: u32,
        #[builder(default = 3)] attempt_budget: u32,
        time_budget: Option<Duration>,
    ) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_fraction: jitter_fraction.clamp(0.0, 0.99),
            inline_retries,
            attempt_budget: attempt_budget.max(1),
            time_budget,
        }
    }
}

impl RetryPolicy {
    /// Whether a failure on inline attempt `attempt` (zero based) should be
    /// retried before the invocation returns.
    pub fn should_retry_locally(&self, category: ErrorCategory, attempt: u32) -> bool {
        match category {
            ErrorCategory::Fatal => false,
            ErrorCategory::Recoverable | ErrorCategory::Unknown => attempt < self.inline_retries,
        }
    }

    /// `base * 2^attempt * (1 + jitter)`, capped at the ceiling.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn backoff_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter_fraction > 0.0 {
            rng.gen_range(-self.jitter_fraction..=self.jitter_fraction)
        } else {
            0.0
        };

        self.cap(self.nominal_secs(attempt) * (1.0 + jitter))
    }

    /// The range every `backoff_delay(attempt)` sample falls in.
    pub fn backoff_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_secs(attempt);
        (
            self.cap(nominal * (1.0 - self.jitter_fraction)),
            self.cap(nominal * (1.0 + self.jitter_fraction)),
        )
    }

    /// Final category of a failure once inline retries are spent.
    ///
    /// `attempt_count` is the lifetime delivery count reported by the queue
    /// and `age` is how long the message has existed. Recoverable and unknown
    /// failures become fatal once either budget is reached.
    pub fn settle(&self, category: ErrorCategory, attempt_count: u32, age: Duration) -> ErrorCategory {
        match category {
            ErrorCategory::Fatal => ErrorCategory::Fatal,
            ErrorCategory::Recoverable | ErrorCategory::Unknown
                if self.budget_exhausted(attempt_count, age) =>
            {
                ErrorCategory::Fatal
            }
            other => other,
        }
    }

    pub fn budget_exhausted(&self, attempt_count: u32, age: Duration) -> bool {
        attempt_count >= self.attempt_budget
            || self.time_budget.is_some_and(|budget| age >= budget)
    }

    pub fn inline_retries(&self) -> u32 {
        self.inline_retries
    }

    pub fn attempt_budget(&self) -> u32 {
        self.attempt_budget
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    fn nominal_secs(&self, attempt: u32) -> f64 {
        // 2^31 seconds is far past any ceiling.
        self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(31) as i32)
    }

    fn cap(&self, secs: f64) -> Duration {
        Duration::from_secs_f64(secs.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}
