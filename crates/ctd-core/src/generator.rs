//! Section draft generation
//!
//! Retrieval-grounded drafting with a deterministic offline path: when the
//! generation backend is absent, fails, times out, or answers with text that
//! does not parse, a placeholder document is emitted instead and the result
//! is marked not ready.

use crate::backend::{bounded, GenerationBackend, GenerationRequest, RetrievalBackend, RetrievalQuery};
use crate::config::PipelineConfig;
use crate::error::BackendError;
use crate::normalize::{TermNormalizer, NEED_INPUT};
use crate::prompts;
use crate::types::{top_unique, Citation, GenerationMetrics, GenerationResult, GenerationThresholds};
use chrono::Utc;
use ctd_rules::{DocumentInstance, Issue, IssueReason, OutputFormat, Section, Severity, Validator};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

const QUERY_CHARS: usize = 500;
const SNIPPET_CHARS: usize = 400;

/// Drafts CTD sections
#[derive(Clone)]
pub struct Generator {
    backend: Option<Arc<dyn GenerationBackend>>,
    retrieval: Option<Arc<dyn RetrievalBackend>>,
    validator: Validator,
    normalizer: TermNormalizer,
    config: PipelineConfig,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("backend", &self.backend.is_some())
            .field("retrieval", &self.retrieval.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Generator {
    /// Create generator without backends (always offline)
    #[must_use]
    pub fn new(validator: Validator, config: PipelineConfig) -> Self {
        Self {
            backend: None,
            retrieval: None,
            normalizer: TermNormalizer::from_ruleset(validator.rules()),
            validator,
            config,
        }
    }

    /// With generation backend
    #[must_use]
    pub fn with_backend(mut self, backend: Option<Arc<dyn GenerationBackend>>) -> Self {
        self.backend = backend;
        self
    }

    /// With retrieval backend for grounding context
    #[must_use]
    pub fn with_retrieval(mut self, retrieval: Option<Arc<dyn RetrievalBackend>>) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Draft a section
    ///
    /// `csv_present` selects the conditional-policy branch for the lint; an
    /// unknown value is treated as "no tabular source".
    pub async fn generate(
        &self,
        section: Section,
        prompt: &str,
        output_format: OutputFormat,
        csv_present: Option<bool>,
    ) -> GenerationResult {
        let csv_present = csv_present.unwrap_or(false);
        let rag_refs = self.references(section, prompt).await;
        let fields = prompts::expected_fields(self.validator.rules().group(section), csv_present);
        let request = GenerationRequest {
            section,
            output_format,
            messages: prompts::generation_messages(
                section,
                prompt,
                &rag_refs,
                output_format,
                &fields,
                &self.config.language,
            ),
        };

        let started = Instant::now();
        let outcome = match &self.backend {
            Some(backend) => bounded(self.config.backend_timeout(), backend.complete(&request)).await,
            None => Err(BackendError::NotConfigured("generation".into())),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    section = %section,
                    error = %e,
                    timed_out = e.is_timeout(),
                    "generation unavailable; emitting placeholder"
                );
                let finding = Issue::new("document", "generation_backend", Severity::Major, IssueReason::OfflineFallback)
                    .with_detail(e.to_string());
                return self.fallback(section, output_format, &fields, rag_refs, finding, e.to_string(), elapsed_ms);
            }
        };

        let raw = self.normalizer.canonicalize_terms(&raw);
        let document = match DocumentInstance::from_text(&raw, output_format) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(section = %section, error = %e, "generation output unparsable; emitting placeholder");
                let reason = format!("unparsable response: {e}");
                let finding = Issue::new("document", "generation_output", Severity::Major, IssueReason::UnparsableResponse)
                    .with_detail(e.to_string());
                return self.fallback(section, output_format, &fields, rag_refs, finding, reason, elapsed_ms);
            }
        };

        let report = self.validator.lint(&document, section, csv_present);
        let lint_major = report.major_count();
        let red_flagged = report.has_red_flags();
        let lint_ok = report.pass;
        let cit_density = citation_density(&raw);
        let gen_score = 0.6 * cit_density + 0.4 * if lint_ok { 1.0 } else { 0.0 };

        tracing::info!(
            section = %section,
            lint_ok,
            lint_major,
            gen_score,
            elapsed_ms,
            "section drafted"
        );

        GenerationResult {
            section,
            output_format,
            text: raw.trim().to_string(),
            document: Some(document),
            lint_ok,
            lint_findings: report.issues,
            rag_used: !rag_refs.is_empty(),
            rag_refs,
            gen_metrics: self.metrics(cit_density, lint_major, gen_score, elapsed_ms),
            ready: lint_ok && !red_flagged,
            offline_fallback: None,
            fallback_reason: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    async fn references(&self, section: Section, prompt: &str) -> Vec<Citation> {
        let Some(retrieval) = &self.retrieval else {
            return Vec::new();
        };
        let query = RetrievalQuery {
            section: Some(section).filter(|s| s.is_known()),
            text: prompt.chars().take(QUERY_CHARS).collect(),
            k: self.config.max_refs,
        };
        match bounded(self.config.backend_timeout(), retrieval.search(&query)).await {
            Ok(snippets) => top_unique(&snippets, self.config.max_refs)
                .iter()
                .map(|s| Citation::from_snippet(s, SNIPPET_CHARS))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "reference lookup for generation failed");
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fallback(
        &self,
        section: Section,
        output_format: OutputFormat,
        fields: &[String],
        rag_refs: Vec<Citation>,
        finding: Issue,
        reason: String,
        elapsed_ms: u64,
    ) -> GenerationResult {
        let placeholder = placeholder_text(section, output_format, fields);
        GenerationResult {
            section,
            output_format,
            text: placeholder.clone(),
            document: None,
            lint_ok: false,
            lint_findings: vec![finding],
            rag_used: !rag_refs.is_empty(),
            rag_refs,
            gen_metrics: self.metrics(0.0, 1, 0.0, elapsed_ms),
            ready: false,
            offline_fallback: Some(placeholder),
            fallback_reason: Some(reason),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn metrics(&self, cit_density: f64, lint_major: usize, gen_score: f64, elapsed_ms: u64) -> GenerationMetrics {
        GenerationMetrics {
            cit_density,
            lint_major,
            gen_score,
            elapsed_ms,
            thresholds: GenerationThresholds {
                generate_ready_min: self.config.generate_ready_min,
                lint_max_major: self.config.lint_max_major,
            },
        }
    }
}

/// Deterministic placeholder document for a section
///
/// Every expected field is set to `NEED_INPUT`, with an empty references list.
#[must_use]
pub fn placeholder_text(section: Section, output_format: OutputFormat, fields: &[String]) -> String {
    match output_format {
        OutputFormat::Markdown => {
            let mut out = format!("### {} Draft\n\n", section.token());
            if fields.is_empty() {
                out.push_str(&format!("- {NEED_INPUT}\n"));
            }
            for field in fields {
                out.push_str(&format!("- **{field}**: {NEED_INPUT}\n"));
            }
            out.push_str("\n## References\n- (none)");
            out
        }
        OutputFormat::Yaml | OutputFormat::Json => {
            let mut doc = DocumentInstance::new();
            doc.insert(NEED_INPUT, Value::Bool(true));
            for field in fields {
                doc.insert(field.as_str(), Value::String(NEED_INPUT.to_string()));
            }
            doc.insert("References", Value::Array(Vec::new()));
            doc.render_fenced(output_format)
        }
    }
}

/// Citation markers per non-empty line, capped at 1
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn citation_density(text: &str) -> f64 {
    let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    if lines == 0 {
        return 0.0;
    }
    let marks = count_citation_marks(text);
    (marks as f64 / lines as f64).min(1.0)
}

/// Occurrences of `[CIT-<digits>]`
fn count_citation_marks(text: &str) -> usize {
    text.match_indices("[CIT-")
        .filter(|(at, marker)| {
            let rest = &text[at + marker.len()..];
            let digits = rest.chars().take_while(char::is_ascii_digit).count();
            digits > 0 && rest[digits..].starts_with(']')
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceSnippet;
    use async_trait::async_trait;
    use ctd_rules::RuleSet;
    use std::time::Duration;

    const RULES: &str = r#"
red_flags:
  phrases: ["TBD"]
normalization:
  terms:
    - { canonical: receptor occupancy, synonyms: [target engagement] }
sections:
  M2.6:
    required: [WrittenSummary]
    policy:
      written:
        blocks: [{ id: Pharmacology, min_len: 10 }]
"#;

    struct Scripted(&'static str);

    #[async_trait]
    impl GenerationBackend for Scripted {
        async fn complete(&self, _: &GenerationRequest) -> Result<String, BackendError> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait]
    impl GenerationBackend for Down {
        async fn complete(&self, _: &GenerationRequest) -> Result<String, BackendError> {
            Err(BackendError::Unavailable("connection refused".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl GenerationBackend for Slow {
        async fn complete(&self, _: &GenerationRequest) -> Result<String, BackendError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(String::new())
        }
    }

    struct Refs;

    #[async_trait]
    impl RetrievalBackend for Refs {
        async fn search(&self, _: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError> {
            Ok(vec![ReferenceSnippet {
                content: "Pharmacology studies should be summarised".into(),
                score: 0.9,
                source: "ICH M4S".into(),
                section: Some("2.6.2".into()),
                page: Some("5".into()),
                para_id: None,
            }])
        }
    }

    fn generator(backend: Option<Arc<dyn GenerationBackend>>) -> Generator {
        let rules = Arc::new(RuleSet::from_yaml_str(RULES).unwrap());
        let config = PipelineConfig::default().with_backend_timeout(Duration::from_secs(1));
        Generator::new(Validator::new(rules), config).with_backend(backend)
    }

    const GOOD: &str = "```yaml\nWrittenSummary:\n  Pharmacology: \"Receptor binding was dose dependent [CIT-1]\"\nReferences: []\n```";

    #[tokio::test]
    async fn good_draft_is_ready() {
        let result = generator(Some(Arc::new(Scripted(GOOD))))
            .with_retrieval(Some(Arc::new(Refs)))
            .generate(Section::NonclinicalSummary, "M2.6 draft", OutputFormat::Yaml, None)
            .await;
        assert!(result.lint_ok);
        assert!(result.ready);
        assert!(result.lint_findings.is_empty());
        assert!(result.offline_fallback.is_none());
        assert_eq!(result.rag_refs.len(), 1);
        assert!(result.rag_used);
        assert!(result.gen_metrics.cit_density > 0.0);
        assert!(result.document.is_some());
    }

    #[tokio::test]
    async fn draft_without_references_is_not_grounded() {
        let result = generator(Some(Arc::new(Scripted(GOOD))))
            .generate(Section::NonclinicalSummary, "M2.6 draft", OutputFormat::Yaml, None)
            .await;
        assert!(result.ready);
        assert!(result.rag_refs.is_empty());
        assert!(!result.rag_used);
    }

    #[tokio::test]
    async fn draft_terms_are_canonicalised_before_lint() {
        let text = "```yaml\nWrittenSummary:\n  Pharmacology: \"Target Engagement was dose dependent [CIT-1]\"\n```";
        let result = generator(Some(Arc::new(Scripted(text))))
            .generate(Section::NonclinicalSummary, "M2.6 draft", OutputFormat::Yaml, None)
            .await;
        assert!(result.ready);
        assert!(result.text.contains("receptor occupancy was dose dependent"), "{}", result.text);
        let summary = result.document.unwrap().get("WrittenSummary").cloned().unwrap();
        assert_eq!(summary["Pharmacology"], "receptor occupancy was dose dependent [CIT-1]");
    }

    #[tokio::test]
    async fn red_flag_blocks_readiness() {
        let text = "WrittenSummary:\n  Pharmacology: \"Binding data TBD for now\"\n";
        let result = generator(Some(Arc::new(Scripted(text))))
            .generate(Section::NonclinicalSummary, "draft", OutputFormat::Yaml, Some(false))
            .await;
        assert!(!result.lint_ok);
        assert!(!result.ready);
        assert!(result.lint_findings.iter().any(|i| i.reason == IssueReason::RedFlag));
    }

    #[tokio::test]
    async fn unavailable_backend_falls_back() {
        let result = generator(Some(Arc::new(Down)))
            .generate(Section::NonclinicalSummary, "draft", OutputFormat::Yaml, None)
            .await;
        assert!(!result.ready);
        assert!(!result.lint_ok);
        let placeholder = result.offline_fallback.as_deref().unwrap();
        let doc = DocumentInstance::from_text(placeholder, OutputFormat::Yaml).unwrap();
        assert_eq!(doc.get(NEED_INPUT), Some(&Value::Bool(true)));
        assert_eq!(doc.get("WrittenSummary"), Some(&Value::String(NEED_INPUT.into())));
        assert_eq!(result.lint_findings[0].reason, IssueReason::OfflineFallback);
        assert!(result.fallback_reason.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn missing_backend_falls_back() {
        let result = generator(None)
            .generate(Section::NonclinicalSummary, "draft", OutputFormat::Markdown, None)
            .await;
        assert!(!result.ready);
        assert!(result.text.starts_with("### M2.6 Draft"));
        assert!(result.text.ends_with("## References\n- (none)"));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let result = generator(Some(Arc::new(Slow)))
            .generate(Section::NonclinicalSummary, "draft", OutputFormat::Json, None)
            .await;
        assert!(!result.ready);
        assert!(result.fallback_reason.unwrap().contains("timed out"));
        assert!(result.offline_fallback.unwrap().starts_with("```json"));
    }

    #[tokio::test]
    async fn unparsable_output_falls_back() {
        let result = generator(Some(Arc::new(Scripted("I cannot help with that."))))
            .generate(Section::NonclinicalSummary, "draft", OutputFormat::Yaml, None)
            .await;
        assert!(!result.ready);
        assert_eq!(result.lint_findings[0].reason, IssueReason::UnparsableResponse);
    }

    #[test]
    fn placeholder_is_deterministic() {
        let fields = vec!["WrittenSummary".to_string()];
        let a = placeholder_text(Section::NonclinicalSummary, OutputFormat::Yaml, &fields);
        let b = placeholder_text(Section::NonclinicalSummary, OutputFormat::Yaml, &fields);
        assert_eq!(a, b);
    }

    #[test]
    fn citation_density_counts_marks() {
        assert!((citation_density("a [CIT-1]\nb [CIT-2]\n\n") - 1.0).abs() < f64::EPSILON);
        assert!((citation_density("a [CIT-1]\nb\nc\nd") - 0.25).abs() < f64::EPSILON);
        assert!(citation_density("").abs() < f64::EPSILON);
        assert_eq!(count_citation_marks("[CIT-12] [CIT-] [CIT-3x] [CIT-4]"), 2);
    }
}
