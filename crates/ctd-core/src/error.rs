//! Error types for CTDMate core
//!
//! Two tiers:
//! - [`BackendError`]: an external service (generation, retrieval, decision)
//!   failed. Always recoverable; stages degrade instead of aborting.
//! - [`PipelineError`]: the run cannot proceed at all (bad rule set, unknown
//!   output format, bad configuration).

use ctd_rules::{DocumentError, RuleSetError};
use serde::Serialize;
use std::time::Duration;

/// External backend failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// No backend wired in (offline mode)
    #[error("{0} backend not configured")]
    NotConfigured(String),

    /// Connection refused, DNS failure, service down
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded its time bound
    #[error("backend timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Non-success HTTP status
    #[error("backend returned status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Response arrived but could not be understood
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    /// Check if error is a timeout
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Fatal pipeline error
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Rule set failed to load or compile
    #[error("rule set error: {0}")]
    RuleSet(#[from] RuleSetError),

    /// Requested output format is not yaml, json or markdown
    #[error("unsupported output format: '{0}'")]
    UnsupportedFormat(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Create configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Stable kind name for reports
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RuleSet(_) => "rule_set",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Config(_) => "config",
        }
    }

    /// Structured form for reports
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<DocumentError> for PipelineError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::UnsupportedFormat(format) => Self::UnsupportedFormat(format),
            other => Self::Config(other.to_string()),
        }
    }
}

/// Serializable fatal error, emitted in place of a pipeline report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Error kind (`rule_set`, `unsupported_format`, `config`)
    pub kind: &'static str,
    /// Human-readable message
    pub message: String,
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_classification() {
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!BackendError::Unavailable("refused".into()).is_timeout());
    }

    #[test]
    fn timeout_display_uses_millis() {
        let err = BackendError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "backend timed out after 250ms");
    }

    #[test]
    fn unsupported_format_converts() {
        let err: PipelineError = DocumentError::UnsupportedFormat("docx".into()).into();
        assert_eq!(err.kind(), "unsupported_format");
        let report = err.to_report();
        assert_eq!(report.message, "unsupported output format: 'docx'");
    }
}
