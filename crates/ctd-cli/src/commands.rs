//! Subcommand execution
//!
//! Every command prints one JSON document on stdout. Reports (even failing or
//! degraded ones) are successes; only contract violations surface as errors.

use crate::cli::DEFAULT_RULES_PATH;
use anyhow::Context as _;
use clap::ArgMatches;
use ctd_backends::{ChatClient, ChatClientConfig, LexicalIndex};
use ctd_core::{
    DecisionClient, ErrorReport, GenerationBackend, Orchestrator, PipelineConfig, PipelineError, PipelineRequest,
    RetrievalBackend,
};
use ctd_rules::{DocumentInstance, Issue, IssueReason, LintReport, OutputFormat, RuleSetCache, Section, Severity};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared settings taken from the global flags and environment
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) rules: PathBuf,
    pub(crate) config: Option<PathBuf>,
    pub(crate) corpus: Option<PathBuf>,
    pub(crate) trace_dir: Option<PathBuf>,
}

impl Settings {
    pub(crate) fn from_matches(matches: &ArgMatches) -> Self {
        Self::resolve(matches, |key| std::env::var(key).ok())
    }

    fn resolve<F>(matches: &ArgMatches, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let rules = matches
            .get_one::<String>("rules")
            .cloned()
            .or_else(|| lookup("CTD_CHECKLIST_PATH").filter(|p| !p.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_RULES_PATH.to_string());
        Self {
            rules: PathBuf::from(rules),
            config: matches.get_one::<String>("config").map(PathBuf::from),
            corpus: matches.get_one::<String>("corpus").map(PathBuf::from),
            trace_dir: matches.get_one::<String>("trace-dir").map(PathBuf::from),
        }
    }
}

/// Assemble the orchestrator from settings
///
/// A missing API key is not an error: generation runs in offline mode and
/// routing stays heuristic.
async fn build_orchestrator(settings: &Settings) -> anyhow::Result<Orchestrator> {
    let rules = RuleSetCache::default()
        .get_or_load(&settings.rules)
        .await
        .map_err(PipelineError::from)?;

    let config = match &settings.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    }
    .apply_env()?;
    let config = match &settings.trace_dir {
        Some(dir) => config.with_trace_dir(Some(dir.clone())),
        None => config,
    };

    let chat = match ChatClient::new(ChatClientConfig::from_env().with_timeout(config.backend_timeout())) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "chat backend unavailable; generation runs offline");
            None
        }
    };

    let retrieval = match &settings.corpus {
        Some(path) => {
            let index = LexicalIndex::load(path)
                .await
                .with_context(|| format!("loading corpus {}", path.display()))?;
            Some(Arc::new(index) as Arc<dyn RetrievalBackend>)
        }
        None => None,
    };

    Ok(Orchestrator::builder(rules)
        .config(config)
        .generation(chat.clone().map(|c| c as Arc<dyn GenerationBackend>))
        .decision(chat.map(|c| c as Arc<dyn DecisionClient>))
        .retrieval(retrieval)
        .build())
}

fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_file(path: &str) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {path}"))
}

fn section_of(args: &ArgMatches) -> Section {
    let section = args
        .get_one::<String>("section")
        .map_or(Section::Unknown, |raw| Section::parse(raw));
    if !section.is_known() {
        tracing::warn!("unknown section; only red flags will be checked");
    }
    section
}

fn names(args: &ArgMatches, id: &str) -> Vec<String> {
    args.get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn parse_format(raw: &str) -> Result<OutputFormat, PipelineError> {
    raw.parse::<OutputFormat>().map_err(PipelineError::from)
}

/// Lint a draft file; unreadable structure is reported as a blocking issue
pub(crate) fn lint_text(orchestrator: &Orchestrator, text: &str, section: Section, attachments: &[String]) -> LintReport {
    let validator = orchestrator.validator();
    let csv_present = validator
        .rules()
        .group(section)
        .is_some_and(|g| g.tabular_source_present(attachments));

    match DocumentInstance::from_submission(text) {
        Ok(document) => validator.lint(&document, section, csv_present),
        Err(e) => LintReport::from_issues(vec![Issue::new(
            "document",
            "document_syntax",
            Severity::Major,
            IssueReason::UnparsableResponse,
        )
        .with_detail(e.to_string())]),
    }
}

/// Run the selected subcommand
pub(crate) async fn dispatch(matches: &ArgMatches) -> anyhow::Result<()> {
    let settings = Settings::from_matches(matches);
    let orchestrator = build_orchestrator(&settings).await?;

    match matches.subcommand() {
        Some(("route", args)) => {
            let text = args.get_one::<String>("text").map_or("", String::as_str);
            emit(&orchestrator.router().route(text).await)
        }
        Some(("lint", args)) => {
            let text = read_file(args.get_one::<String>("file").map_or("", String::as_str))?;
            let report = lint_text(&orchestrator, &text, section_of(args), &names(args, "csv"));
            emit(&report)
        }
        Some(("check", args)) => {
            let text = read_file(args.get_one::<String>("file").map_or("", String::as_str))?;
            let result = orchestrator
                .reference()
                .validate_and_normalize(section_of(args), &text, !args.get_flag("no-autofix"))
                .await;
            emit(&result)
        }
        Some(("generate", args)) => {
            let section = section_of(args);
            let format = parse_format(args.get_one::<String>("format").map_or("yaml", String::as_str))?;
            let prompt = args.get_one::<String>("prompt").map_or("", String::as_str);
            let csv_present = orchestrator
                .validator()
                .rules()
                .group(section)
                .is_some_and(|g| g.tabular_source_present(&names(args, "csv")));
            let result = orchestrator
                .generator()
                .generate(section, prompt, format, Some(csv_present))
                .await;
            emit(&result)
        }
        Some(("run", args)) => {
            let mut request = PipelineRequest::new(args.get_one::<String>("text").map_or("", String::as_str))
                .with_attachments(names(args, "attach"));
            if let Some(path) = args.get_one::<String>("content") {
                request = request.with_content(read_file(path)?);
            }
            if let Some(section) = args.get_one::<String>("section") {
                request = request.with_section(section.as_str());
            }
            if let Some(format) = args.get_one::<String>("format") {
                request = request.with_output_format(format.as_str());
            }
            if args.get_flag("no-autofix") {
                request = request.with_auto_fix(false);
            }
            emit(&orchestrator.run(request).await?)
        }
        _ => anyhow::bail!("no subcommand given"),
    }
}

/// Structured form of a fatal error
pub(crate) fn error_report(err: &anyhow::Error) -> ErrorReport {
    match err.downcast_ref::<PipelineError>() {
        Some(pipeline) => pipeline.to_report(),
        None => ErrorReport {
            kind: "cli",
            message: format!("{err:#}"),
        },
    }
}
