//! Reference validation
//!
//! Scores free text against retrieved regulatory guidance and normalises it.
//! Retrieval is optional: without a backend, or when the backend fails, the
//! result is computed from local heuristics and marked `rag_used = false`.
//!
//! # Scoring
//!
//! ```text
//! coverage    = field_coverage                                 (no references)
//!             = 0.5 * field_coverage + 0.5 * reference_coverage (references)
//! reference_coverage = 0.6 * mean(top-5 score) + 0.4 * min(1, n / 5)
//! rag_conf    = mean(top-3 score)
//! score_raw   = 0.55 * coverage + 0.30 * rag_conf + 0.15 * glossary_hit
//! score       = max(0, score_raw - 0.05 * violation_weight)
//! ```

use crate::backend::{bounded, ReferenceSnippet, RetrievalBackend, RetrievalQuery};
use crate::config::PipelineConfig;
use crate::normalize::{find_placeholders, TermNormalizer};
use crate::types::{top_unique, Citation, ReferenceThresholds, ValidationMetrics, ValidationResult};
use ctd_rules::{Issue, IssueReason, RuleSet, Section, Severity};
use std::sync::Arc;

/// Regulator guidance whose weak matches are reported
pub const REGULATOR_SOURCE: &str = "MFDS";
/// Regulator scores below this are reported
pub const LOW_SIMILARITY: f64 = 0.80;
/// Guideline scores below this are reported as major
pub const VERY_LOW_SIMILARITY: f64 = 0.70;

const QUERY_CHARS: usize = 500;
const SNIPPET_CHARS: usize = 200;
const EXPANSION_K: usize = 3;

/// Reference validation over an optional retrieval backend
#[derive(Clone)]
pub struct ReferenceIndex {
    retrieval: Option<Arc<dyn RetrievalBackend>>,
    rules: Arc<RuleSet>,
    normalizer: TermNormalizer,
    config: PipelineConfig,
}

impl std::fmt::Debug for ReferenceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceIndex")
            .field("retrieval", &self.retrieval.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReferenceIndex {
    /// Create index without retrieval
    #[must_use]
    pub fn new(rules: Arc<RuleSet>, config: PipelineConfig) -> Self {
        Self {
            normalizer: TermNormalizer::from_ruleset(&rules),
            retrieval: None,
            rules,
            config,
        }
    }

    /// With retrieval backend
    #[must_use]
    pub fn with_retrieval(mut self, retrieval: Option<Arc<dyn RetrievalBackend>>) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Normaliser in use
    #[inline]
    #[must_use]
    pub fn normalizer(&self) -> &TermNormalizer {
        &self.normalizer
    }

    /// Validate and (optionally) normalise free text for a section
    ///
    /// Never fails: retrieval problems lower confidence and are recorded in
    /// `metrics.retrieval_error`.
    pub async fn validate_and_normalize(&self, section: Section, content: &str, auto_fix: bool) -> ValidationResult {
        let (mut guidelines, mut retrieval_error) = self
            .retrieve(Some(section).filter(|s| s.is_known()), content, self.config.retrieval_k)
            .await;

        let before = self.detect(content, &guidelines).len();
        let normalized = if auto_fix {
            self.normalizer.normalize(content)
        } else {
            content.to_string()
        };

        let field_coverage = self.field_coverage(section, &normalized);
        let mut coverage = blend_coverage(field_coverage, &guidelines);

        // Weak coverage: widen the search past the section before scoring.
        if coverage < self.config.coverage_min && self.retrieval.is_some() && retrieval_error.is_none() {
            let (extra, err) = self.retrieve(None, &normalized, EXPANSION_K).await;
            if err.is_none() && !extra.is_empty() {
                guidelines.extend(extra);
                guidelines = top_unique(&guidelines, self.config.retrieval_k + EXPANSION_K);
                coverage = blend_coverage(field_coverage, &guidelines);
            }
            retrieval_error = retrieval_error.or(err);
        }

        let issues = self.detect(&normalized, &guidelines);
        let rag_used = !guidelines.is_empty();
        let rag_confidence = mean_top(&guidelines, 3);
        let glossary_hit = self.glossary_hit(&normalized);
        let violation_weight: u32 = issues.iter().map(|i| i.severity.weight()).sum();

        let score_raw = 0.55 * coverage + 0.30 * rag_confidence + 0.15 * glossary_hit;
        let score = (score_raw - 0.05 * f64::from(violation_weight)).max(0.0);
        let reference_pass = coverage >= self.config.coverage_min
            && rag_confidence >= self.config.rag_conf_min
            && violation_weight <= self.config.violation_weight_max;

        let citations = top_unique(&guidelines, self.config.max_refs)
            .iter()
            .map(|s| Citation::from_snippet(s, SNIPPET_CHARS))
            .collect();

        let pass = !issues.iter().any(Issue::is_blocking);
        tracing::debug!(
            section = %section,
            coverage,
            rag_confidence,
            violation_weight,
            pass,
            rag_used,
            "reference validation finished"
        );

        ValidationResult {
            section,
            validated: true,
            pass,
            normalized_content: normalized,
            coverage,
            citations,
            rag_confidence,
            rag_used,
            metrics: ValidationMetrics {
                score_raw,
                score,
                violation_weight,
                glossary_hit,
                reference_pass,
                fixed_issues: before.saturating_sub(issues.len()),
                retrieval_error,
                thresholds: ReferenceThresholds {
                    coverage_min: self.config.coverage_min,
                    rag_conf_min: self.config.rag_conf_min,
                    violation_weight_max: self.config.violation_weight_max,
                },
            },
            issues,
        }
    }

    async fn retrieve(
        &self,
        section: Option<Section>,
        text: &str,
        k: usize,
    ) -> (Vec<ReferenceSnippet>, Option<String>) {
        let Some(retrieval) = &self.retrieval else {
            return (Vec::new(), None);
        };
        let query = RetrievalQuery {
            section,
            text: text.chars().take(QUERY_CHARS).collect(),
            k,
        };
        match bounded(self.config.backend_timeout(), retrieval.search(&query)).await {
            Ok(mut snippets) => {
                for s in &mut snippets {
                    s.score = s.score.clamp(0.0, 1.0);
                }
                snippets.truncate(k);
                (snippets, None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed; continuing without references");
                (Vec::new(), Some(e.to_string()))
            }
        }
    }

    fn detect(&self, text: &str, guidelines: &[ReferenceSnippet]) -> Vec<Issue> {
        let mut issues: Vec<Issue> = find_placeholders(text)
            .into_iter()
            .map(|hit| {
                Issue::new("content", "placeholder", Severity::Minor, IssueReason::Placeholder)
                    .at(format!("line {}", hit.line))
                    .with_detail(hit.text)
            })
            .collect();

        let weak = guidelines
            .iter()
            .filter(|g| g.score < LOW_SIMILARITY && g.source.eq_ignore_ascii_case(REGULATOR_SOURCE));
        for guideline in weak {
            let severity = if guideline.score < VERY_LOW_SIMILARITY {
                Severity::Major
            } else {
                Severity::Minor
            };
            issues.push(
                Issue::new(
                    "content",
                    format!("guideline:{}", guideline.source),
                    severity,
                    IssueReason::LowGuidelineSimilarity,
                )
                .with_detail(format!("similarity {:.2}", guideline.score)),
            );
        }
        issues
    }

    /// Share of the section's field names mentioned in the text
    fn field_coverage(&self, section: Section, text: &str) -> f64 {
        let names = self
            .rules
            .group(section)
            .map(|g| g.field_names())
            .unwrap_or_default();
        if names.is_empty() {
            return if text.trim().is_empty() { 0.0 } else { 1.0 };
        }
        let lowered = text.to_lowercase();
        let hit = names
            .iter()
            .filter(|name| {
                let plain = name.to_lowercase();
                lowered.contains(&plain) || lowered.contains(&split_camel(name))
            })
            .count();
        ratio(hit, names.len())
    }

    fn glossary_hit(&self, text: &str) -> f64 {
        let terms: Vec<&str> = self.normalizer.canonical_terms().collect();
        if terms.is_empty() {
            return 0.0;
        }
        let lowered = text.to_lowercase();
        let hit = terms.iter().filter(|t| lowered.contains(&t.to_lowercase())).count();
        ratio(hit, terms.len())
    }
}

fn blend_coverage(field_coverage: f64, guidelines: &[ReferenceSnippet]) -> f64 {
    if guidelines.is_empty() {
        return field_coverage;
    }
    let top = mean_top(guidelines, 5);
    let volume = ratio(guidelines.len().min(5), 5);
    let reference_coverage = 0.6 * top + 0.4 * volume;
    (0.5 * field_coverage + 0.5 * reference_coverage).clamp(0.0, 1.0)
}

fn mean_top(snippets: &[ReferenceSnippet], n: usize) -> f64 {
    let mut scores: Vec<f64> = snippets.iter().map(|s| s.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    scores.truncate(n);
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// "WrittenSummary" -> "written summary"
fn split_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            out.push(' ');
        }
        out.extend(c.to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;

    const RULES: &str = r#"
normalization:
  terms:
    - canonical: drug substance
      synonyms: [active substance]
sections:
  M2.6:
    required: [WrittenSummary]
    policy:
      tabulated_fields: [TabulatedSummaries]
"#;

    struct StaticRetrieval(Vec<ReferenceSnippet>);

    #[async_trait]
    impl RetrievalBackend for StaticRetrieval {
        async fn search(&self, query: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError> {
            Ok(self.0.iter().take(query.k).cloned().collect())
        }
    }

    struct DownRetrieval;

    #[async_trait]
    impl RetrievalBackend for DownRetrieval {
        async fn search(&self, _: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError> {
            Err(BackendError::Unavailable("connection refused".into()))
        }
    }

    fn snippet(source: &str, score: f64) -> ReferenceSnippet {
        ReferenceSnippet {
            content: format!("guidance from {source}"),
            score,
            source: source.to_string(),
            section: Some("M2.6".into()),
            page: Some("1".into()),
            para_id: None,
        }
    }

    fn index() -> ReferenceIndex {
        ReferenceIndex::new(Arc::new(RuleSet::from_yaml_str(RULES).unwrap()), PipelineConfig::default())
    }

    #[tokio::test]
    async fn local_only_when_no_backend() {
        let result = index()
            .validate_and_normalize(Section::NonclinicalSummary, "Written summary of tabulated summaries", true)
            .await;
        assert!(result.validated);
        assert!(!result.rag_used);
        assert!(result.citations.is_empty());
        assert!((result.rag_confidence).abs() < f64::EPSILON);
        assert!((result.coverage - 1.0).abs() < 1e-9);
        assert!(result.metrics.retrieval_error.is_none());
        assert!(!result.metrics.reference_pass);
    }

    #[tokio::test]
    async fn backend_failure_degrades() {
        let index = index().with_retrieval(Some(Arc::new(DownRetrieval)));
        let result = index
            .validate_and_normalize(Section::NonclinicalSummary, "anything", true)
            .await;
        assert!(result.validated);
        assert!(!result.rag_used);
        assert!(result.metrics.retrieval_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn strong_references_pass() {
        let refs = (0..5).map(|i| snippet(&format!("ICH-{i}"), 0.95)).collect();
        let index = index().with_retrieval(Some(Arc::new(StaticRetrieval(refs))));
        let result = index
            .validate_and_normalize(
                Section::NonclinicalSummary,
                "The written summary references tabulated summaries for the drug substance",
                true,
            )
            .await;
        assert!(result.rag_used);
        assert!(result.pass);
        assert!(result.issues.is_empty());
        assert!((result.rag_confidence - 0.95).abs() < 1e-9);
        assert!(result.metrics.reference_pass, "{:?}", result.metrics);
        assert_eq!(result.citations.len(), 5);
        assert!((result.metrics.glossary_hit - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn weak_reference_is_a_major_issue() {
        let index = index().with_retrieval(Some(Arc::new(StaticRetrieval(vec![snippet("MFDS", 0.5)]))));
        let result = index
            .validate_and_normalize(Section::NonclinicalSummary, "written summary", true)
            .await;
        assert!(!result.pass);
        let issue = &result.issues[0];
        assert_eq!(issue.reason, IssueReason::LowGuidelineSimilarity);
        assert_eq!(issue.severity, Severity::Major);
        assert_eq!(issue.rule_triggered, "guideline:MFDS");
    }

    #[tokio::test]
    async fn weak_non_regulator_reference_is_not_an_issue() {
        let refs = vec![snippet("ICH M4S", 0.92), snippet("ICH S7A", 0.65), snippet("MFDS", 0.75)];
        let index = index().with_retrieval(Some(Arc::new(StaticRetrieval(refs))));
        let result = index
            .validate_and_normalize(Section::NonclinicalSummary, "written summary", true)
            .await;
        assert!(result.pass);
        assert_eq!(result.issues.len(), 1, "{:?}", result.issues);
        assert_eq!(result.issues[0].severity, Severity::Minor);
        assert_eq!(result.issues[0].rule_triggered, "guideline:MFDS");
    }

    #[tokio::test]
    async fn auto_fix_removes_placeholders() {
        let text = "Pharmacology results are TBD pending the final report";
        let fixed = index()
            .validate_and_normalize(Section::NonclinicalSummary, text, true)
            .await;
        assert!(fixed.normalized_content.contains("NEED_INPUT"));
        assert!(fixed.issues.is_empty());
        assert_eq!(fixed.metrics.fixed_issues, 1);

        let raw = index()
            .validate_and_normalize(Section::NonclinicalSummary, text, false)
            .await;
        assert_eq!(raw.normalized_content, text);
        assert_eq!(raw.issues.len(), 1);
        assert_eq!(raw.issues[0].reason, IssueReason::Placeholder);
        // Placeholders are minor
        assert!(raw.pass);
    }

    #[tokio::test]
    async fn scores_stay_in_unit_range() {
        let refs = vec![snippet("A", 1.7), snippet("B", -0.3)];
        let index = index().with_retrieval(Some(Arc::new(StaticRetrieval(refs))));
        let result = index
            .validate_and_normalize(Section::Unknown, "tbd tbd tbd tbd", false)
            .await;
        for value in [result.coverage, result.rag_confidence, result.metrics.score, result.metrics.glossary_hit] {
            assert!((0.0..=1.0).contains(&value), "{value}");
        }
    }

    #[test]
    fn camel_case_split() {
        assert_eq!(split_camel("WrittenSummary"), "written summary");
        assert_eq!(split_camel("References"), "references");
    }
}
