//! Backend seams
//!
//! Every external service the pipeline talks to sits behind one of these
//! traits and is held as `Arc<dyn Trait>`. Absent backends are `None` at the
//! call site; failures come back as [`BackendError`] and are turned into
//! degraded results by the caller.

use crate::error::BackendError;
use async_trait::async_trait;
use ctd_rules::{OutputFormat, Section};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Chat role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions
    System,
    /// Request
    User,
    /// Prior model turn
    Assistant,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role
    pub role: ChatRole,
    /// Text
    pub content: String,
}

impl ChatMessage {
    /// System message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// User message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Input to a generation backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    /// Section being drafted
    pub section: Section,
    /// Format the draft must be in
    pub output_format: OutputFormat,
    /// Full prompt
    pub messages: Vec<ChatMessage>,
}

/// Input to a retrieval backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalQuery {
    /// Restrict to guidance for this section; `None` searches everything
    pub section: Option<Section>,
    /// Query text
    pub text: String,
    /// Maximum results
    pub k: usize,
}

/// One retrieved guideline snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSnippet {
    /// Snippet text
    pub content: String,
    /// Similarity in `[0, 1]`
    pub score: f64,
    /// Source document
    pub source: String,
    /// Section of the source document
    #[serde(default)]
    pub section: Option<String>,
    /// Page in the source document
    #[serde(default)]
    pub page: Option<String>,
    /// Paragraph identifier
    #[serde(default)]
    pub para_id: Option<String>,
}

/// Produces section drafts from a prompt
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Complete the prompt; the raw model text is returned
    async fn complete(&self, request: &GenerationRequest) -> Result<String, BackendError>;
}

/// Retrieves guideline snippets
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    /// Top-`k` snippets for the query, best first
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError>;
}

/// Optional model used to refine routing decisions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionClient: Send + Sync {
    /// Answer a routing prompt; expected to contain one JSON object
    async fn decide(&self, system: &str, user: &str) -> Result<String, BackendError>;
}

/// Run a backend call under a time bound
///
/// Elapsed bounds become [`BackendError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}
