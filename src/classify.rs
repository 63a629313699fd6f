//! Failure classification.
//!
//! Every error raised while processing a message is mapped to exactly one
//! [`ErrorCategory`]. Classification is a pure function of the error value:
//! equivalent errors always land in the same category.
//!
//! Rules, in priority order:
//!
//! 1. permission denied, not found, malformed input, unsupported content,
//!    unparseable content and index schema rejections are [`ErrorCategory::Fatal`]
//! 2. timeouts, throttling, transport failures and 5xx-equivalents are
//!    [`ErrorCategory::Recoverable`]
//! 3. everything else is [`ErrorCategory::Unknown`]
//!
//! [`Error::ResourceExhaustion`] classifies as recoverable, but it describes
//! the host rather than the message: the pipeline never escalates it, and the
//! worker loop answers it with backpressure.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Disposition class of a failure.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient; the message should be left for redelivery.
    Recoverable,
    /// Permanent; the message is dead-lettered and deleted.
    Fatal,
    /// Not matched by any rule. Treated as recoverable until the retry
    /// budget runs out.
    Unknown,
}

impl ErrorCategory {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

const FATAL_SIGNATURES: &[&str] = &[
    "permission denied",
    "access denied",
    "accessdenied",
    "forbidden",
    "not found",
    "no such",
    "nosuchkey",
    "malformed",
    "invalid format",
    "unsupported",
];

const RECOVERABLE_SIGNATURES: &[&str] = &[
    "timed out",
    "timeout",
    "throttl",
    "rate exceeded",
    "too many requests",
    "slow down",
    "connection reset",
    "connection refused",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
];

/// Map an error to its category.
pub fn classify(err: &Error) -> ErrorCategory {
    match err {
        Error::AccessDenied { .. }
        | Error::NotFound { .. }
        | Error::Validation { .. }
        | Error::UnsupportedContentType { .. }
        | Error::Corruption { .. }
        | Error::IndexSchema { .. }
        | Error::Configuration { .. } => ErrorCategory::Fatal,

        Error::Timeout { .. }
        | Error::Throttled { .. }
        | Error::Transport { .. }
        | Error::IndexTransient { .. }
        | Error::ResourceExhaustion { .. } => ErrorCategory::Recoverable,

        Error::Upstream { status, .. } => classify_status(*status),

        Error::WorkerCrashed { .. } => ErrorCategory::Unknown,

        Error::Whatever { message, .. } => classify_message(message),
    }
}

/// Status-code rules for upstream services that only report HTTP semantics.
pub fn classify_status(status: u16) -> ErrorCategory {
    match status {
        408 | 429 => ErrorCategory::Recoverable,
        500..=599 => ErrorCategory::Recoverable,
        400 | 401 | 403 | 404 | 410 | 413 | 415 | 422 => ErrorCategory::Fatal,
        _ => ErrorCategory::Unknown,
    }
}

// Untyped errors carry only text, so match on well-known signatures.
fn classify_message(message: &str) -> ErrorCategory {
    let message = message.to_ascii_lowercase();

    if FATAL_SIGNATURES.iter().any(|sig| message.contains(sig)) {
        ErrorCategory::Fatal
    } else if RECOVERABLE_SIGNATURES.iter().any(|sig| message.contains(sig)) {
        ErrorCategory::Recoverable
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use snafu::FromString;

    use super::*;
    use crate::error::Stage;

    fn untyped(message: &str) -> Error {
        Error::without_source(message.to_owned())
    }

    #[test]
    fn test_fatal_rules() {
        let cases = vec![
            Error::access_denied("s3://bucket/key"),
            Error::not_found("s3://bucket/key"),
            Error::validation("missing key"),
            Error::unsupported(".exe"),
            Error::corruption("truncated xref table"),
            Error::index_schema("mapper_parsing_exception"),
            untyped("Permission denied (os error 13)"),
            untyped("NoSuchKey: the specified key does not exist"),
        ];

        for err in cases {
            assert_eq!(classify(&err), ErrorCategory::Fatal, "{err}");
        }
    }

    #[test]
    fn test_recoverable_rules() {
        let cases = vec![
            Error::timeout(Stage::Index, Duration::from_secs(30)),
            Error::Throttled {
                message: "slow down".to_owned(),
            },
            Error::transport(eyre::eyre!("connection reset by peer")),
            Error::index_transient("cluster_block_exception"),
            Error::Upstream {
                status: 503,
                message: "unavailable".to_owned(),
            },
            untyped("operation timed out"),
            untyped("Rate exceeded"),
        ];

        for err in cases {
            assert_eq!(classify(&err), ErrorCategory::Recoverable, "{err}");
        }
    }

    #[test]
    fn test_unmatched_is_unknown() {
        let cases = vec![
            untyped("something odd happened"),
            Error::WorkerCrashed {
                message: "task panicked".to_owned(),
            },
            Error::Upstream {
                status: 418,
                message: "teapot".to_owned(),
            },
        ];

        for err in cases {
            assert_eq!(classify(&err), ErrorCategory::Unknown, "{err}");
        }
    }

    #[test]
    fn test_fatal_signatures_win_over_recoverable() {
        // Matches both "not found" and "timeout"; the fatal rule has priority.
        let err = untyped("lookup timeout: object not found");
        assert_eq!(classify(&err), ErrorCategory::Fatal);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let make = || {
            vec![
                untyped("weird failure #42"),
                Error::not_found("key"),
                Error::timeout(Stage::Download, Duration::from_secs(1)),
                Error::Upstream {
                    status: 500,
                    message: "oops".to_owned(),
                },
            ]
        };

        let first: Vec<_> = make().iter().map(classify).collect();
        for _ in 0..16 {
            let again: Vec<_> = make().iter().map(classify).collect();
            assert_eq!(first, again);
        }
    }
}
