//! Error types for the concrete backends
//!
//! Both enums are converted into [`BackendError`] at the trait boundary, so the
//! pipeline only ever sees the core taxonomy.

use ctd_core::BackendError;
use std::path::PathBuf;
use std::time::Duration;

/// Chat-completion client failure
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Missing API key or base URL
    #[error("chat client not configured: {0}")]
    NotConfigured(String),

    /// Could not reach the service
    #[error("cannot reach {0}")]
    Connection(String),

    /// Request exceeded the client timeout
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Non-success HTTP status
    #[error("chat endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Response body did not match the completion schema
    #[error("cannot decode completion: {0}")]
    Decode(String),

    /// Completion contained no text
    #[error("completion contained no choices")]
    EmptyResponse,
}

impl From<ClientError> for BackendError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotConfigured(what) => Self::NotConfigured(what),
            ClientError::Connection(target) => Self::Unavailable(target),
            ClientError::Timeout(limit) => Self::Timeout(limit),
            ClientError::Status { status, body } => Self::Status { status, body },
            ClientError::Decode(message) => Self::MalformedResponse(message),
            ClientError::EmptyResponse => Self::MalformedResponse("empty completion".to_string()),
        }
    }
}

/// Reference corpus loading failure
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    /// Corpus file unreadable
    #[error("cannot read corpus {path}: {source}")]
    Io {
        /// Corpus path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A record failed to parse
    #[error("corpus record {line}: {message}")]
    Parse {
        /// 1-based line (JSONL) or record index (YAML / JSON)
        line: usize,
        /// Parser message
        message: String,
    },
}

impl CorpusError {
    /// Create parse error
    #[inline]
    pub fn parse_error(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}

/// Result alias for corpus operations
pub type CorpusResult<T> = Result<T, CorpusError>;
