//! Pipeline orchestrator
//!
//! A run is a straight walk through the stages:
//!
//! ```text
//! Route → [Parse] → [Retrieve] → [Generate] → [Validate] → Done
//! ```
//!
//! Bracketed stages run only when the plan asks for them. No stage is ever
//! revisited. Backend failures degrade a stage; only a fatal
//! [`PipelineError`] stops a run.

use crate::backend::{DecisionClient, GenerationBackend, RetrievalBackend};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::generator::Generator;
use crate::reference::ReferenceIndex;
use crate::router::Router;
use crate::trace::RunTrace;
use crate::types::{
    DocumentOrigin, GenerationResult, ParseOutcome, PipelineReport, PipelineRequest, PlanSource, RouterPlan, RunId,
    Stage, StageStatus, StageTrace, ValidateOutcome, ValidationResult,
};
use ctd_rules::document::extract_fenced_block;
use chrono::{DateTime, Utc};
use ctd_rules::{DocumentInstance, OutputFormat, RuleSet, Section, Validator};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Illegal stage transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal stage transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// Stage left
    pub from: Stage,
    /// Stage entered
    pub to: Stage,
}

/// Stages that may directly follow `from`
#[must_use]
pub fn allowed_transitions(from: Stage) -> Vec<Stage> {
    use Stage::{Done, Generate, Parse, Retrieve, Route, Validate};
    match from {
        Route => vec![Parse, Retrieve, Generate, Validate, Done],
        Parse => vec![Retrieve, Generate, Validate, Done],
        Retrieve => vec![Generate, Validate, Done],
        Generate => vec![Validate, Done],
        Validate => vec![Done],
        Done => vec![],
    }
}

/// Check a stage transition
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Next stage the plan enables after `current`
#[must_use]
pub fn next_stage(current: Stage, plan: &RouterPlan) -> Option<Stage> {
    allowed_transitions(current).into_iter().find(|stage| match stage {
        Stage::Parse => plan.need_parse,
        Stage::Retrieve => plan.need_rag,
        Stage::Generate => plan.need_generate,
        Stage::Validate => plan.need_validate,
        Stage::Route | Stage::Done => true,
    })
}

/// Write the run trace; failures are logged and leave `trace_file` unset
async fn persist_trace(dir: &Path, report: &PipelineReport, started_at: DateTime<Utc>) -> Option<String> {
    let trace = RunTrace::from_report(report, started_at, Utc::now());
    match trace.write(dir).await {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "run trace written");
            Some(path.display().to_string())
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "could not write run trace");
            None
        }
    }
}

/// Accumulated state of one run
#[derive(Debug)]
struct PipelineState {
    run_id: RunId,
    parse: Option<ParseOutcome>,
    retrieve: Option<ValidationResult>,
    generate: Option<GenerationResult>,
    validate: Option<ValidateOutcome>,
    gate_blocked: bool,
    trace: Vec<StageTrace>,
}

impl PipelineState {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            parse: None,
            retrieve: None,
            generate: None,
            validate: None,
            gate_blocked: false,
            trace: Vec::new(),
        }
    }

    fn record(&mut self, stage: Stage, status: StageStatus, note: Option<String>, started: Instant) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(?stage, ?status, elapsed_ms, note = note.as_deref().unwrap_or(""), "stage finished");
        self.trace.push(StageTrace {
            stage,
            status,
            note,
            elapsed_ms,
        });
    }

    fn parsed_document(&self) -> Option<&DocumentInstance> {
        self.parse.as_ref().and_then(|p| p.document.as_ref())
    }

    fn finish(self, plan: RouterPlan) -> PipelineReport {
        // Reference validation is a soft signal; it feeds `metrics.reference_pass` only
        let ok = self.parse.as_ref().map_or(true, |p| p.ok)
            && self.generate.as_ref().map_or(!self.gate_blocked, |g| g.ready)
            && self.validate.as_ref().map_or(true, |v| v.pass);
        let degraded = plan.source == PlanSource::HeuristicFallback
            || self.retrieve.as_ref().is_some_and(|r| !r.rag_used)
            || self
                .generate
                .as_ref()
                .is_some_and(|g| g.offline_fallback.is_some() || !g.rag_used);

        PipelineReport {
            run_id: self.run_id,
            ok,
            degraded,
            plan,
            parse: self.parse,
            retrieve: self.retrieve,
            generate: self.generate,
            validate: self.validate,
            trace: self.trace,
            trace_file: None,
        }
    }
}

/// Builder for [`Orchestrator`]
#[derive(Clone)]
pub struct OrchestratorBuilder {
    rules: Arc<RuleSet>,
    config: PipelineConfig,
    generation: Option<Arc<dyn GenerationBackend>>,
    retrieval: Option<Arc<dyn RetrievalBackend>>,
    decision: Option<Arc<dyn DecisionClient>>,
}

impl OrchestratorBuilder {
    /// With configuration
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// With generation backend
    #[must_use]
    pub fn generation(mut self, backend: Option<Arc<dyn GenerationBackend>>) -> Self {
        self.generation = backend;
        self
    }

    /// With retrieval backend
    #[must_use]
    pub fn retrieval(mut self, backend: Option<Arc<dyn RetrievalBackend>>) -> Self {
        self.retrieval = backend;
        self
    }

    /// With decision model for routing
    #[must_use]
    pub fn decision(mut self, client: Option<Arc<dyn DecisionClient>>) -> Self {
        self.decision = client;
        self
    }

    /// Assemble the orchestrator
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let validator = Validator::new(Arc::clone(&self.rules));
        let router = Router::new()
            .with_decision(self.decision)
            .with_timeout(self.config.backend_timeout());
        let reference = ReferenceIndex::new(Arc::clone(&self.rules), self.config.clone())
            .with_retrieval(self.retrieval.clone());
        let generator = Generator::new(validator.clone(), self.config.clone())
            .with_backend(self.generation)
            .with_retrieval(self.retrieval);

        Orchestrator {
            router,
            reference,
            generator,
            validator,
            config: self.config,
        }
    }
}

/// Drives a request through routing, reference validation, generation and lint
#[derive(Debug, Clone)]
pub struct Orchestrator {
    router: Router,
    reference: ReferenceIndex,
    generator: Generator,
    validator: Validator,
    config: PipelineConfig,
}

impl Orchestrator {
    /// Start building an orchestrator over a compiled rule set
    #[must_use]
    pub fn builder(rules: Arc<RuleSet>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            rules,
            config: PipelineConfig::default(),
            generation: None,
            retrieval: None,
            decision: None,
        }
    }

    /// Router
    #[inline]
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Reference validation
    #[inline]
    #[must_use]
    pub fn reference(&self) -> &ReferenceIndex {
        &self.reference
    }

    /// Generator
    #[inline]
    #[must_use]
    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Structural validator
    #[inline]
    #[must_use]
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a description-only request
    pub async fn run_text(&self, description: &str) -> PipelineResult<PipelineReport> {
        self.run(PipelineRequest::new(description)).await
    }

    /// Run one request end to end
    ///
    /// # Errors
    ///
    /// Only an unsupported output-format override is fatal here; every
    /// backend problem is reported inside the returned report.
    pub async fn run(&self, request: PipelineRequest) -> PipelineResult<PipelineReport> {
        let run_id = RunId::new();
        let span = tracing::info_span!("pipeline", %run_id);
        async move {
            let started_at = Utc::now();
            let mut report = self.execute(run_id, request).await?;
            if let Some(dir) = &self.config.trace_dir {
                report.trace_file = persist_trace(dir, &report, started_at).await;
            }
            Ok::<_, PipelineError>(report)
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: RunId, request: PipelineRequest) -> PipelineResult<PipelineReport> {
        let format_override = request
            .output_format
            .as_deref()
            .map(str::parse::<OutputFormat>)
            .transpose()?;
        let auto_fix = request.auto_fix.unwrap_or(self.config.auto_fix);

        tracing::info!(chars = request.description.chars().count(), "pipeline started");
        let mut state = PipelineState::new(run_id);

        let started = Instant::now();
        let plan = self.plan(&request, format_override).await;
        let (status, note) = if plan.source == PlanSource::HeuristicFallback {
            (StageStatus::Degraded, Some("decision model unavailable".to_string()))
        } else {
            (StageStatus::Completed, None)
        };
        state.record(Stage::Route, status, note, started);
        tracing::info!(
            action = ?plan.action,
            section = %plan.section,
            output_format = %plan.output_format,
            need_parse = plan.need_parse,
            need_rag = plan.need_rag,
            need_generate = plan.need_generate,
            need_validate = plan.need_validate,
            "plan fixed"
        );

        let mut stage = Stage::Route;
        while let Some(next) = next_stage(stage, &plan) {
            debug_assert!(validate_transition(stage, next).is_ok());
            match next {
                Stage::Parse => self.parse_stage(&request, &mut state),
                Stage::Retrieve => self.retrieve_stage(&request, &plan, auto_fix, &mut state).await,
                Stage::Generate => self.generate_stage(&request, &plan, &mut state).await,
                Stage::Validate => self.validate_stage(&request, &plan, &mut state),
                Stage::Route | Stage::Done => {}
            }
            stage = next;
        }

        let report = state.finish(plan);
        tracing::info!(ok = report.ok, degraded = report.degraded, stages = report.trace.len(), "pipeline finished");
        Ok(report)
    }

    /// Route, then apply caller overrides; the plan is fixed afterwards
    async fn plan(&self, request: &PipelineRequest, format_override: Option<OutputFormat>) -> RouterPlan {
        let mut plan = self.router.route(&request.description).await;

        if let Some(raw) = request.section.as_deref() {
            let section = Section::parse(raw);
            if section.is_known() {
                plan.section = section;
            } else {
                tracing::warn!(section = raw, "ignoring unknown section override");
            }
        }
        if let Some(format) = format_override {
            plan.output_format = format;
        }
        if request.content.is_some() {
            plan.need_parse = true;
        }
        plan
    }

    fn tabular_source_present(&self, request: &PipelineRequest, section: Section) -> bool {
        self.validator
            .rules()
            .group(section)
            .is_some_and(|group| group.tabular_source_present(&request.attachments))
    }

    fn parse_stage(&self, request: &PipelineRequest, state: &mut PipelineState) {
        let started = Instant::now();
        let source = request
            .content
            .as_deref()
            .or_else(|| extract_fenced_block(&request.description, &["yaml", "yml", "json", ""]));

        let outcome = match source.map(DocumentInstance::from_submission) {
            Some(Ok(document)) => ParseOutcome {
                ok: true,
                document: Some(document),
                error: None,
            },
            Some(Err(e)) => ParseOutcome {
                ok: false,
                document: None,
                error: Some(e.to_string()),
            },
            None => ParseOutcome {
                ok: false,
                document: None,
                error: Some("no structured content supplied".to_string()),
            },
        };

        let status = if outcome.ok {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        let note = outcome.error.clone();
        state.parse = Some(outcome);
        state.record(Stage::Parse, status, note, started);
    }

    async fn retrieve_stage(
        &self,
        request: &PipelineRequest,
        plan: &RouterPlan,
        auto_fix: bool,
        state: &mut PipelineState,
    ) {
        let started = Instant::now();
        let text = request.content.as_deref().unwrap_or(&request.description);
        let result = self.reference.validate_and_normalize(plan.section, text, auto_fix).await;

        let (status, note) = if result.rag_used {
            (StageStatus::Completed, None)
        } else {
            let note = result
                .metrics
                .retrieval_error
                .clone()
                .unwrap_or_else(|| "no references retrieved".to_string());
            (StageStatus::Degraded, Some(note))
        };
        state.retrieve = Some(result);
        state.record(Stage::Retrieve, status, note, started);
    }

    async fn generate_stage(&self, request: &PipelineRequest, plan: &RouterPlan, state: &mut PipelineState) {
        let started = Instant::now();

        if let (Some(gate), Some(retrieved)) = (self.config.generate_gate, state.retrieve.as_ref()) {
            let score = retrieved.metrics.score;
            if score < gate {
                tracing::info!(score, gate, "generation gate not met");
                state.gate_blocked = true;
                state.record(
                    Stage::Generate,
                    StageStatus::Skipped,
                    Some(format!("gate_not_met: score {score:.2} < {gate:.2}")),
                    started,
                );
                return;
            }
        }

        let normalized = state.retrieve.as_ref().map(|r| r.normalized_content.as_str());
        let prompt = match (&request.content, normalized) {
            (Some(content), normalized) => {
                format!("{}\n\n{}", request.description.trim(), normalized.unwrap_or(content))
            }
            (None, Some(normalized)) => normalized.to_string(),
            (None, None) => request.description.clone(),
        };
        let csv_present = self.tabular_source_present(request, plan.section);

        let result = self
            .generator
            .generate(plan.section, &prompt, plan.output_format, Some(csv_present))
            .await;

        let (status, note) = match &result.fallback_reason {
            Some(reason) => (StageStatus::Degraded, Some(reason.clone())),
            None => (StageStatus::Completed, None),
        };
        state.generate = Some(result);
        state.record(Stage::Generate, status, note, started);
    }

    fn validate_stage(&self, request: &PipelineRequest, plan: &RouterPlan, state: &mut PipelineState) {
        let started = Instant::now();
        let csv_present = self.tabular_source_present(request, plan.section);

        let generated = state.generate.as_ref().and_then(|g| g.document.as_ref().map(|d| (g, d)));
        let outcome = match (generated, state.parsed_document()) {
            (Some((generation, document)), _) => {
                let report = self.validator.lint(document, plan.section, csv_present);
                let consistent = report.pass == generation.lint_ok && report.issues == generation.lint_findings;
                Some(ValidateOutcome {
                    origin: DocumentOrigin::Generated,
                    pass: report.pass,
                    issues: report.issues,
                    consistent: Some(consistent),
                })
            }
            (None, Some(document)) => {
                let report = self.validator.lint(document, plan.section, csv_present);
                Some(ValidateOutcome {
                    origin: DocumentOrigin::Submitted,
                    pass: report.pass,
                    issues: report.issues,
                    consistent: None,
                })
            }
            (None, None) => None,
        };

        let Some(outcome) = outcome else {
            state.record(
                Stage::Validate,
                StageStatus::Skipped,
                Some("no document to validate".to_string()),
                started,
            );
            return;
        };

        if outcome.consistent == Some(false) {
            tracing::warn!("final lint disagrees with generation lint");
        }
        let status = if outcome.pass {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        state.validate = Some(outcome);
        state.record(Stage::Validate, status, None, started);
    }
}
