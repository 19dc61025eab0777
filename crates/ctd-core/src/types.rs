//! Core types for CTDMate
//!
//! Defines the values that flow between stages and end up in the report:
//! - Router plans
//! - Reference-validation and generation results
//! - Pipeline requests, stage outcomes and the final report

use crate::backend::ReferenceSnippet;
use ctd_rules::{DocumentInstance, Issue, OutputFormat, Section};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use ulid::Ulid;

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary action chosen by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Parse submitted material only
    Parse,
    /// Reference lookup / reference validation only
    Retrieve,
    /// Draft a section
    Generate,
    /// Check an existing draft
    Validate,
    /// Full pipeline
    #[default]
    Pipeline,
}

impl Action {
    /// Lenient parse; unknown names become `Pipeline`
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "parse" => Self::Parse,
            "retrieve" | "rag" => Self::Retrieve,
            "generate" => Self::Generate,
            "validate" => Self::Validate,
            _ => Self::Pipeline,
        }
    }
}

/// Where a plan's decisions came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    /// Keyword heuristics only (no decision model configured)
    Heuristic,
    /// Heuristic base refined by the decision model
    Model,
    /// Decision model configured but failed or answered unusably
    HeuristicFallback,
}

/// Routing decision for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterPlan {
    /// Primary action
    pub action: Action,
    /// Target section
    pub section: Section,
    /// Run the parse stage
    pub need_parse: bool,
    /// Run reference validation
    pub need_rag: bool,
    /// Run generation
    pub need_generate: bool,
    /// Run the final lint
    pub need_validate: bool,
    /// Format for generated output
    pub output_format: OutputFormat,
    /// Provenance
    pub source: PlanSource,
}

/// A reference attached to a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Source document
    pub source: String,
    /// Section of the source document
    pub section: Option<String>,
    /// Page
    pub page: Option<String>,
    /// Paragraph identifier
    pub para_id: Option<String>,
    /// Excerpt
    pub snippet: String,
    /// Similarity in `[0, 1]`
    pub score: f64,
}

impl Citation {
    /// Build from a snippet, clipping the excerpt to `max_chars`
    #[must_use]
    pub fn from_snippet(snippet: &ReferenceSnippet, max_chars: usize) -> Self {
        Self {
            source: snippet.source.clone(),
            section: snippet.section.clone(),
            page: snippet.page.clone(),
            para_id: snippet.para_id.clone(),
            snippet: clip(&snippet.content, max_chars),
            score: snippet.score.clamp(0.0, 1.0),
        }
    }
}

/// Best-first snippets with duplicate `(source, page)` pairs dropped, capped at `k`
#[must_use]
pub fn top_unique(snippets: &[ReferenceSnippet], k: usize) -> Vec<ReferenceSnippet> {
    let mut sorted: Vec<&ReferenceSnippet> = snippets.iter().collect();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut seen = HashSet::new();
    sorted
        .into_iter()
        .filter(|s| seen.insert((s.source.clone(), s.page.clone())))
        .take(k)
        .cloned()
        .collect()
}

/// Clip to `max_chars` characters, marking the cut with "..."
#[must_use]
pub fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Thresholds in force when a score was computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceThresholds {
    /// Minimum coverage
    pub coverage_min: f64,
    /// Minimum retrieval confidence
    pub rag_conf_min: f64,
    /// Maximum violation weight
    pub violation_weight_max: u32,
}

/// Scoring detail for reference validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    /// Weighted score before the violation penalty
    pub score_raw: f64,
    /// Final score in `[0, 1]`
    pub score: f64,
    /// Summed issue weight
    pub violation_weight: u32,
    /// Share of preferred terms present in the content
    pub glossary_hit: f64,
    /// Coverage, confidence and violation thresholds all met
    pub reference_pass: bool,
    /// Issues removed by normalisation
    pub fixed_issues: usize,
    /// Retrieval failure, if the retrieval backend was configured but failed
    pub retrieval_error: Option<String>,
    /// Thresholds applied
    pub thresholds: ReferenceThresholds,
}

/// Result of reference validation and normalisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Section validated against
    pub section: Section,
    /// Local validation ran to completion
    pub validated: bool,
    /// No major issue remains after normalisation
    pub pass: bool,
    /// Content after normalisation (or as submitted)
    pub normalized_content: String,
    /// Heuristic share of the section's field space addressed, `[0, 1]`
    pub coverage: f64,
    /// Supporting guidance
    pub citations: Vec<Citation>,
    /// Mean of the top retrieval scores, `[0, 1]`
    pub rag_confidence: f64,
    /// Retrieval contributed to this result
    pub rag_used: bool,
    /// Issues remaining after normalisation
    pub issues: Vec<Issue>,
    /// Scoring detail
    pub metrics: ValidationMetrics,
}

/// Thresholds reported with generation metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationThresholds {
    /// Score considered ready
    pub generate_ready_min: f64,
    /// Major lint issues tolerated
    pub lint_max_major: usize,
}

/// Scoring detail for a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    /// Citation markers per non-empty line, capped at 1
    pub cit_density: f64,
    /// Major lint issues in the draft
    pub lint_major: usize,
    /// `0.6 * cit_density + 0.4 * lint_ok`
    pub gen_score: f64,
    /// Wall-clock time of the backend call
    pub elapsed_ms: u64,
    /// Thresholds in force
    pub thresholds: GenerationThresholds,
}

/// Result of drafting a section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Section drafted
    pub section: Section,
    /// Format of `text`
    pub output_format: OutputFormat,
    /// Draft text (the placeholder when offline)
    pub text: String,
    /// Parsed draft, absent on fallback
    pub document: Option<DocumentInstance>,
    /// Draft passed the structural lint
    pub lint_ok: bool,
    /// Lint issues, or the reason a fallback was emitted
    pub lint_findings: Vec<Issue>,
    /// References used as generation context
    pub rag_refs: Vec<Citation>,
    /// Draft was grounded on at least one retrieved reference
    pub rag_used: bool,
    /// Scoring detail
    pub gen_metrics: GenerationMetrics,
    /// Lint passed and no red flag fired
    pub ready: bool,
    /// Placeholder document emitted because the backend was unavailable
    pub offline_fallback: Option<String>,
    /// Why the fallback was taken
    pub fallback_reason: Option<String>,
    /// Generation time (RFC 3339)
    pub created_at: String,
}

/// One pipeline invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineRequest {
    /// Natural-language request
    pub description: String,
    /// Submitted structured content (YAML or JSON)
    pub content: Option<String>,
    /// Names of attached files (used for tabular-source detection)
    pub attachments: Vec<String>,
    /// Section override
    pub section: Option<String>,
    /// Output format override
    pub output_format: Option<String>,
    /// Auto-fix override
    pub auto_fix: Option<bool>,
}

impl PipelineRequest {
    /// Request from a description only
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// With submitted content
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// With attachment names
    #[must_use]
    pub fn with_attachments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attachments.extend(names.into_iter().map(Into::into));
        self
    }

    /// With section override
    #[must_use]
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// With output format override
    #[must_use]
    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    /// With auto-fix override
    #[must_use]
    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = Some(auto_fix);
        self
    }
}

/// Parse stage outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseOutcome {
    /// Content parsed into a mapping
    pub ok: bool,
    /// Parsed document
    pub document: Option<DocumentInstance>,
    /// Parse failure
    pub error: Option<String>,
}

/// Which document the final lint checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentOrigin {
    /// Produced by the generate stage
    Generated,
    /// Supplied by the caller
    Submitted,
}

/// Validate stage outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateOutcome {
    /// Which document was checked
    pub origin: DocumentOrigin,
    /// No major issues
    pub pass: bool,
    /// Issues found
    pub issues: Vec<Issue>,
    /// For generated drafts: this lint agrees with the generator's own lint
    pub consistent: Option<bool>,
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Plan fixed
    Route,
    /// Submitted content parsed
    Parse,
    /// Reference validation
    Retrieve,
    /// Draft generation
    Generate,
    /// Final lint
    Validate,
    /// Terminal
    Done,
}

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Completed normally
    Completed,
    /// Completed with reduced fidelity (backend unavailable)
    Degraded,
    /// Failed; the run continued
    Failed,
    /// Entered but deliberately not executed
    Skipped,
}

/// One trace entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTrace {
    /// Stage
    pub stage: Stage,
    /// Outcome
    pub status: StageStatus,
    /// Explanation for non-completed outcomes
    pub note: Option<String>,
    /// Stage duration
    pub elapsed_ms: u64,
}

/// Final pipeline output
///
/// Every stage key is always present; stages that did not run are `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Run identifier
    pub run_id: RunId,
    /// Every executed stage succeeded and the draft (if any) is ready
    pub ok: bool,
    /// Some stage ran with reduced fidelity
    pub degraded: bool,
    /// Routing decision
    pub plan: RouterPlan,
    /// Parse stage result
    pub parse: Option<ParseOutcome>,
    /// Reference validation result
    pub retrieve: Option<ValidationResult>,
    /// Generation result
    pub generate: Option<GenerationResult>,
    /// Final lint result
    pub validate: Option<ValidateOutcome>,
    /// Stage trace in execution order
    pub trace: Vec<StageTrace>,
    /// Persisted run trace, when a trace directory is configured
    pub trace_file: Option<String>,
}

impl PipelineReport {
    /// Stages that actually ran, in order
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        self.trace.iter().map(|t| t.stage).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(source: &str, page: &str, score: f64) -> ReferenceSnippet {
        ReferenceSnippet {
            content: format!("{source} p{page}"),
            score,
            source: source.to_string(),
            section: None,
            page: Some(page.to_string()),
            para_id: None,
        }
    }

    #[test]
    fn action_parse_is_lenient() {
        assert_eq!(Action::parse("GENERATE"), Action::Generate);
        assert_eq!(Action::parse("rag"), Action::Retrieve);
        assert_eq!(Action::parse("summon"), Action::Pipeline);
    }

    #[test]
    fn top_unique_dedups_and_orders() {
        let refs = vec![
            snippet("ICH-M4", "1", 0.5),
            snippet("ICH-M4", "1", 0.9),
            snippet("ICH-M4", "2", 0.7),
            snippet("MFDS", "1", 0.8),
        ];
        let top = top_unique(&refs, 2);
        assert_eq!(top.len(), 2);
        assert!((top[0].score - 0.9).abs() < f64::EPSILON);
        assert_eq!(top[1].source, "MFDS");
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("비임상 요약", 3), "비임상...");
        assert_eq!(clip("short", 10), "short");
    }

    #[test]
    fn request_builder() {
        let req = PipelineRequest::new("M2.6 draft")
            .with_attachments(["m26_01_tox.csv"])
            .with_output_format("json");
        assert_eq!(req.attachments, vec!["m26_01_tox.csv".to_string()]);
        assert_eq!(req.output_format.as_deref(), Some("json"));
        assert_eq!(req.auto_fix, None);
    }

    #[test]
    fn run_id_displays_as_ulid() {
        let id = RunId::new();
        assert_eq!(id.to_string().len(), 26);
    }
}
