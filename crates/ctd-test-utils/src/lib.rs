//! Testing utilities for the CTDMate workspace
//!
//! Shared fixture rules, scripted backends and orchestrator setup.

#![allow(missing_docs)]

use async_trait::async_trait;
use ctd_core::{
    BackendError, DecisionClient, GenerationBackend, GenerationRequest, Orchestrator, PipelineConfig,
    ReferenceSnippet, RetrievalBackend, RetrievalQuery,
};
use ctd_rules::RuleSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Checklist shared by the workspace tests
pub const RULES_YAML: &str = include_str!("../fixtures/rules.yaml");

pub fn fixture_rules() -> Arc<RuleSet> {
    Arc::new(RuleSet::from_yaml_str(RULES_YAML).expect("fixture rules compile"))
}

/// A clean M2.6 draft that passes the fixture checklist
pub fn pharmacology_yaml() -> String {
    "```yaml\n\
     WrittenSummary:\n  \
       Pharmacology: \"Primary pharmacodynamics showed dose-dependent receptor inhibition [CIT-1].\"\n\
     References:\n  \
       - { doc: \"ICH M4S\", page: 12 }\n\
     ```"
        .to_string()
}

pub fn snippet(source: &str, page: &str, score: f64, content: &str) -> ReferenceSnippet {
    ReferenceSnippet {
        content: content.to_string(),
        score,
        source: source.to_string(),
        section: None,
        page: Some(page.to_string()),
        para_id: None,
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Returns the same text for every call and records the requests
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    text: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.requests.lock().expect("requests lock").last().cloned()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedGenerator {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests lock").push(request.clone());
        Ok(self.text.clone())
    }
}

/// Always unreachable
#[derive(Debug, Default)]
pub struct UnavailableGenerator;

#[async_trait]
impl GenerationBackend for UnavailableGenerator {
    async fn complete(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
        Err(BackendError::Unavailable("connection refused".to_string()))
    }
}

/// Answers only after a delay
#[derive(Debug)]
pub struct SlowGenerator {
    delay: Duration,
    text: String,
}

impl SlowGenerator {
    pub fn new(delay: Duration, text: impl Into<String>) -> Self {
        Self {
            delay,
            text: text.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for SlowGenerator {
    async fn complete(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.text.clone())
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Returns a fixed snippet list (truncated to `k`)
#[derive(Debug, Default)]
pub struct StaticRetriever {
    snippets: Vec<ReferenceSnippet>,
    queries: Mutex<Vec<RetrievalQuery>>,
}

impl StaticRetriever {
    pub fn new(snippets: Vec<ReferenceSnippet>) -> Self {
        Self {
            snippets,
            queries: Mutex::default(),
        }
    }

    pub fn queries(&self) -> Vec<RetrievalQuery> {
        self.queries.lock().expect("queries lock").clone()
    }
}

#[async_trait]
impl RetrievalBackend for StaticRetriever {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError> {
        self.queries.lock().expect("queries lock").push(query.clone());
        Ok(self.snippets.iter().take(query.k).cloned().collect())
    }
}

/// Always unreachable
#[derive(Debug, Default)]
pub struct UnavailableRetriever;

#[async_trait]
impl RetrievalBackend for UnavailableRetriever {
    async fn search(&self, _query: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError> {
        Err(BackendError::Unavailable("index offline".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Answers every routing prompt with the same text
#[derive(Debug)]
pub struct ScriptedDecision {
    answer: Result<String, BackendError>,
}

impl ScriptedDecision {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: Ok(answer.into()),
        }
    }

    pub fn failing(error: BackendError) -> Self {
        Self { answer: Err(error) }
    }
}

#[async_trait]
impl DecisionClient for ScriptedDecision {
    async fn decide(&self, _system: &str, _user: &str) -> Result<String, BackendError> {
        self.answer.clone()
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Orchestrator over the fixture rules with default configuration
pub fn orchestrator_with(
    generation: Option<Arc<dyn GenerationBackend>>,
    retrieval: Option<Arc<dyn RetrievalBackend>>,
) -> Orchestrator {
    Orchestrator::builder(fixture_rules())
        .config(PipelineConfig::default())
        .generation(generation)
        .retrieval(retrieval)
        .build()
}

/// Install a test-writer subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
