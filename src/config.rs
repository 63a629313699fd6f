//! Worker configuration.
//!
//! Read once at startup from `SLUICE_`-prefixed environment variables and
//! validated before anything touches the queue. The resulting value is
//! immutable; components receive derived values (durations, the retry
//! policy, thresholds) through the accessors below.
//!
//! The visibility timeout must outlast the slowest possible delivery: every
//! inline attempt hitting every stage timeout, plus the backoff between
//! attempts. A shorter timeout would let a receipt lapse mid-processing.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::{
    batch::{default_pool_size, RECEIPT_MARGIN},
    error::Error, queue::MAX_BATCH_SIZE, resources::Thresholds,
    retry::RetryPolicy,
};

pub const ENV_PREFIX: &str = "SLUICE_";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub queue_url: String,
    pub dead_letter_destination: String,

    #[serde(default = "defaults::max_messages_per_batch")]
    pub max_messages_per_batch: usize,
    #[serde(default = "defaults::wait_time_seconds")]
    pub wait_time_seconds: u64,
    #[serde(default = "defaults::visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,
    pub max_workers: Option<usize>,

    #[serde(default = "defaults::local_retry_budget")]
    pub local_retry_budget: u32,
    #[serde(default = "defaults::inline_retries")]
    pub inline_retries: u32,
    #[serde(default = "defaults::backoff_base_delay_ms")]
    pub backoff_base_delay_ms: u64,
    #[serde(default = "defaults::backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
    #[serde(default = "defaults::backoff_jitter_fraction")]
    pub backoff_jitter_fraction: f64,
    pub retry_time_budget_secs: Option<u64>,

    #[serde(default = "defaults::min_free_memory_percent")]
    pub min_free_memory_percent: f64,
    #[serde(default = "defaults::min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
    pub max_cpu_percent: Option<f64>,
    #[serde(default = "defaults::admission_backoff_seconds")]
    pub admission_backoff_seconds: u64,
    #[serde(default = "defaults::poll_error_backoff_seconds")]
    pub poll_error_backoff_seconds: u64,

    #[serde(default = "defaults::download_timeout_seconds")]
    pub download_timeout_seconds: u64,
    #[serde(default = "defaults::processing_timeout_seconds")]
    pub processing_timeout_seconds: u64,
    #[serde(default = "defaults::index_timeout_seconds")]
    pub index_timeout_seconds: u64,

    #[serde(default = "defaults::temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "defaults::temp_file_max_age_seconds")]
    pub temp_file_max_age_seconds: u64,
    #[serde(default = "defaults::storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "defaults::index_path")]
    pub index_path: PathBuf,
    pub default_bucket: Option<String>,
    /// Identifies this process in dead-letter records.
    pub worker_id: Option<String>,
}

mod defaults {
    use std::path::PathBuf;

    pub fn max_messages_per_batch() -> usize {
        10
    }
    pub fn wait_time_seconds() -> u64 {
        20
    }
    pub fn visibility_timeout_seconds() -> u64 {
        1200
    }
    pub fn local_retry_budget() -> u32 {
        3
    }
    pub fn inline_retries() -> u32 {
        2
    }
    pub fn backoff_base_delay_ms() -> u64 {
        2_000
    }
    pub fn backoff_max_delay_ms() -> u64 {
        60_000
    }
    pub fn backoff_jitter_fraction() -> f64 {
        0.25
    }
    pub fn min_free_memory_percent() -> f64 {
        10.0
    }
    pub fn min_free_disk_bytes() -> u64 {
        1024 * 1024 * 1024
    }
    pub fn admission_backoff_seconds() -> u64 {
        30
    }
    pub fn poll_error_backoff_seconds() -> u64 {
        5
    }
    pub fn download_timeout_seconds() -> u64 {
        60
    }
    pub fn processing_timeout_seconds() -> u64 {
        180
    }
    pub fn index_timeout_seconds() -> u64 {
        30
    }
    pub fn temp_dir() -> PathBuf {
        std::env::temp_dir().join("sluice")
    }
    pub fn temp_file_max_age_seconds() -> u64 {
        24 * 60 * 60
    }
    pub fn storage_root() -> PathBuf {
        PathBuf::from("./storage")
    }
    pub fn index_path() -> PathBuf {
        PathBuf::from("./index.jsonl")
    }
}

impl Config {
    /// Load and validate from the process environment.
    pub fn load() -> Result<Self, Error> {
        let config = envy::prefixed(ENV_PREFIX).from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate from explicit `(name, value)` pairs.
    pub fn from_iter<I>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::prefixed(ENV_PREFIX).from_iter::<_, Self>(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("queue_url", &self.queue_url),
            ("dead_letter_destination", &self.dead_letter_destination),
        ] {
            url::Url::parse(value).map_err(|e| {
                Error::configuration(format!("{name} {value:?} is not a valid URL: {e}"))
            })?;
        }

        if self.queue_url == self.dead_letter_destination {
            return Err(Error::configuration(
                "dead_letter_destination must differ from queue_url",
            ));
        }

        if !(1..=MAX_BATCH_SIZE).contains(&self.max_messages_per_batch) {
            return Err(Error::configuration(format!(
                "max_messages_per_batch must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }

        if self.wait_time_seconds > 20 {
            return Err(Error::configuration(
                "wait_time_seconds must be at most 20",
            ));
        }

        if self.max_workers == Some(0) {
            return Err(Error::configuration("max_workers must be at least 1"));
        }

        if self.local_retry_budget == 0 {
            return Err(Error::configuration(
                "local_retry_budget must be at least 1",
            ));
        }

        if !(0.0..1.0).contains(&self.backoff_jitter_fraction) {
            return Err(Error::configuration(
                "backoff_jitter_fraction must be in [0, 1)",
            ));
        }

        if self.backoff_max_delay_ms < self.backoff_base_delay_ms {
            return Err(Error::configuration(
                "backoff_max_delay_ms must not be below backoff_base_delay_ms",
            ));
        }

        if !(0.0..100.0).contains(&self.min_free_memory_percent) {
            return Err(Error::configuration(
                "min_free_memory_percent must be in [0, 100)",
            ));
        }

        if let Some(cpu) = self.max_cpu_percent {
            if !(cpu > 0.0 && cpu <= 100.0) {
                return Err(Error::configuration("max_cpu_percent must be in (0, 100]"));
            }
        }

        for (name, secs) in [
            ("visibility_timeout_seconds", self.visibility_timeout_seconds),
            ("download_timeout_seconds", self.download_timeout_seconds),
            ("processing_timeout_seconds", self.processing_timeout_seconds),
            ("index_timeout_seconds", self.index_timeout_seconds),
        ] {
            if secs == 0 {
                return Err(Error::configuration(format!("{name} must be positive")));
            }
        }

        let worst_case = self.worst_case_processing();
        if worst_case.saturating_add(RECEIPT_MARGIN) >= self.visibility_timeout() {
            return Err(Error::configuration(format!(
                "visibility_timeout_seconds ({}) must exceed the worst-case processing time \
                 of {:.1}s plus a {}s margin",
                self.visibility_timeout_seconds,
                worst_case.as_secs_f64(),
                RECEIPT_MARGIN.as_secs(),
            )));
        }

        Ok(())
    }

    /// Longest a single delivery can take before the pipeline gives up on it.
    ///
    /// Each attempt may hit the download, processing and index timeouts, plus
    /// a thumbnail upload bounded by the download timeout.
    pub fn worst_case_processing(&self) -> Duration {
        let per_attempt = self
            .download_timeout()
            .saturating_mul(2)
            .saturating_add(self.processing_timeout())
            .saturating_add(self.index_timeout());
        let attempts = per_attempt.saturating_mul(self.inline_retries.saturating_add(1));

        let policy = self.retry_policy();
        (0..self.inline_retries)
            .map(|attempt| policy.backoff_bounds(attempt).1)
            .fold(attempts, Duration::saturating_add)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(default_pool_size)
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("sluice-{}", std::process::id()))
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn admission_backoff(&self) -> Duration {
        Duration::from_secs(self.admission_backoff_seconds)
    }

    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_secs(self.poll_error_backoff_seconds)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_seconds)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_seconds)
    }

    pub fn temp_file_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_file_max_age_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .base_delay(Duration::from_millis(self.backoff_base_delay_ms))
            .max_delay(Duration::from_millis(self.backoff_max_delay_ms))
            .jitter_fraction(self.backoff_jitter_fraction)
            .inline_retries(self.inline_retries)
            .attempt_budget(self.local_retry_budget)
            .maybe_time_budget(self.retry_time_budget_secs.map(Duration::from_secs))
            .build()
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from_free_memory_percent(
            self.min_free_memory_percent,
            self.min_free_disk_bytes,
            self.max_cpu_percent,
        )
    }
}
