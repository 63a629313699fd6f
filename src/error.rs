use std::time::Duration;

use snafu::Snafu;

/// Pipeline stage a failure was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Receive,
    Download,
    Process,
    Upload,
    Index,
    DeadLetter,
    Delete,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid configuration: {message}"))]
    Configuration { message: String },

    #[snafu(display("transport error: {message}"))]
    Transport {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("access denied: {resource}"))]
    AccessDenied { resource: String },

    #[snafu(display("{resource} not found"))]
    NotFound { resource: String },

    #[snafu(display("malformed input: {message}"))]
    Validation { message: String },

    #[snafu(display("unsupported content type: {content_type}"))]
    UnsupportedContentType { content_type: String },

    #[snafu(display("{stage} timed out after {}s", elapsed.as_secs_f64()))]
    Timeout { stage: Stage, elapsed: Duration },

    #[snafu(display("throttled: {message}"))]
    Throttled { message: String },

    #[snafu(display("unparseable content: {message}"))]
    Corruption { message: String },

    #[snafu(display("transient indexing failure: {message}"))]
    IndexTransient { message: String },

    #[snafu(display("index rejected document: {message}"))]
    IndexSchema { message: String },

    #[snafu(display("upstream returned {status}: {message}"))]
    Upstream { status: u16, message: String },

    #[snafu(display("resources exhausted: {message}"))]
    ResourceExhaustion { message: String },

    #[snafu(display("worker task failed: {message}"))]
    WorkerCrashed { message: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        // ENOSPC
        if e.raw_os_error() == Some(28) {
            return Self::ResourceExhaustion {
                message: e.to_string(),
            };
        }

        match e.kind() {
            ErrorKind::NotFound => Self::NotFound {
                resource: e.to_string(),
            },
            ErrorKind::PermissionDenied => Self::AccessDenied {
                resource: e.to_string(),
            },
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => Self::Corruption {
                message: e.to_string(),
            },
            ErrorKind::TimedOut => Self::Transport {
                message: e.to_string(),
                source: Some(e.into()),
            },
            ErrorKind::OutOfMemory => Self::ResourceExhaustion {
                message: e.to_string(),
            },
            _ => Self::Transport {
                message: e.to_string(),
                source: Some(e.into()),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation {
            message: e.to_string(),
        }
    }
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Self::Configuration {
            message: e.to_string(),
        }
    }
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn transport(e: impl Into<eyre::Report>) -> Self {
        let report = e.into();
        Self::Transport {
            message: format!("{report}"),
            source: Some(report),
        }
    }

    pub fn access_denied(resource: impl Into<String>) -> Self {
        Self::AccessDenied {
            resource: resource.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unsupported(content_type: impl Into<String>) -> Self {
        Self::UnsupportedContentType {
            content_type: content_type.into(),
        }
    }

    pub fn timeout(stage: Stage, elapsed: Duration) -> Self {
        Self::Timeout { stage, elapsed }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    pub fn index_transient(message: impl Into<String>) -> Self {
        Self::IndexTransient {
            message: message.into(),
        }
    }

    pub fn index_schema(message: impl Into<String>) -> Self {
        Self::IndexSchema {
            message: message.into(),
        }
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhaustion {
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Host-level exhaustion (memory, disk). Never a property of the message.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhaustion { .. })
    }
}
