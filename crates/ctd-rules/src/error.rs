//! Error types for rule sets and document parsing
//!
//! Two failure families live here:
//! - Rule-set errors (checklist load/compile). These are fatal to a run.
//! - Document errors (submitted or generated text that is not a mapping).
//!   These are recorded in stage results and never abort a run.

use std::path::PathBuf;

/// Errors while loading or compiling a rule set
#[derive(Debug, thiserror::Error)]
pub enum RuleSetError {
    /// IO error during rule file read
    #[error("io error reading {path}: {source}")]
    Io {
        /// File that failed to load
        path: PathBuf,
        /// Underlying IO failure
        #[source]
        source: std::io::Error,
    },

    /// The rule file is not valid YAML or does not match the rule schema
    #[error("syntax error in rule set {origin}: {message}")]
    Syntax {
        /// Path or label of the rule source
        origin: String,
        /// Parser message
        message: String,
    },

    /// A section key that does not name a CTD section
    #[error("unknown section key '{0}' in rule set")]
    UnknownSection(String),

    /// A pattern constraint or red-flag pattern that does not compile
    #[error("invalid pattern for {field}: {message}")]
    InvalidPattern {
        /// Field (or `red_flags`) the pattern belongs to
        field: String,
        /// Regex compiler message
        message: String,
    },

    /// `allowed_values_ref` points at a value set that does not exist
    #[error("field {field} references unknown value set '{reference}'")]
    UnknownValueSet {
        /// Field declaring the reference
        field: String,
        /// Reference as written in the rule file
        reference: String,
    },
}

impl RuleSetError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create syntax error for a rule source
    pub fn syntax_error(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Syntax {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Create pattern compile error
    pub fn invalid_pattern(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors while turning text into a document instance
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// Output format name that is not yaml, json or markdown
    #[error("unsupported output format: '{0}'")]
    UnsupportedFormat(String),

    /// Text is not parseable in the expected format
    #[error("{format} syntax error: {message}")]
    Syntax {
        /// Format that was attempted
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// Parsed fine but the top level is not a key-value mapping
    #[error("document top level must be a mapping, found {0}")]
    NotAMapping(&'static str),

    /// Nothing to parse
    #[error("empty document")]
    Empty,
}

impl DocumentError {
    /// Create syntax error for a format
    pub fn syntax_error(format: &'static str, message: impl Into<String>) -> Self {
        Self::Syntax {
            format,
            message: message.into(),
        }
    }
}

/// Combined rules-crate error
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    /// Rule set failure
    #[error("rule set error: {0}")]
    RuleSet(#[from] RuleSetError),

    /// Document failure
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
}

/// Result type alias for rule-set operations
pub type RuleSetResult<T> = Result<T, RuleSetError>;
