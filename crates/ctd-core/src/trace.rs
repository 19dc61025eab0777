//! Per-run JSON trace
//!
//! When a trace directory is configured, every run leaves `<dir>/<run_id>.json`
//! behind: the plan, stage timings, the references that were consulted, the
//! headline scores and a digest of the text the run produced. The trace is an
//! audit aid; failing to write it never fails the run.

use crate::types::{clip, Citation, PipelineReport, RouterPlan, RunId, StageTrace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Component name recorded in every trace
pub const COMPONENT: &str = "pipeline";

const PREVIEW_CHARS: usize = 1000;
const SNIPPET_CHARS: usize = 300;

/// Reference as recorded in a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedRef {
    /// Source document
    pub source: String,
    /// Page, when known
    pub page: Option<String>,
    /// Similarity in `[0, 1]`
    pub score: f64,
    /// Clipped excerpt
    pub snippet: String,
}

/// Text produced by the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracedOutput {
    /// Leading part of the text
    pub preview: String,
    /// Length in characters
    pub chars: usize,
    /// Hex SHA-256 of the full text
    pub sha256: String,
}

/// Persisted record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    /// Run identifier, also the file stem
    pub run_id: RunId,
    /// Producing component
    pub component: String,
    /// Run start (RFC 3339)
    pub started_at: String,
    /// Run end (RFC 3339)
    pub ended_at: String,
    /// Outcome flags copied from the report
    pub ok: bool,
    /// Some stage ran with reduced fidelity
    pub degraded: bool,
    /// Routing decision
    pub plan: RouterPlan,
    /// Stage timings in execution order
    pub stages: Vec<StageTrace>,
    /// References consulted, one per source page
    pub refs: Vec<TracedRef>,
    /// Headline scores of the stages that ran
    pub metrics: BTreeMap<String, f64>,
    /// Draft text, or the normalised input when nothing was generated
    pub output: Option<TracedOutput>,
}

impl RunTrace {
    /// Build the trace of a finished run
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_report(report: &PipelineReport, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        let mut metrics = BTreeMap::new();
        let mut refs = Vec::new();

        if let Some(retrieve) = &report.retrieve {
            metrics.insert("coverage".to_string(), retrieve.coverage);
            metrics.insert("rag_confidence".to_string(), retrieve.rag_confidence);
            metrics.insert("reference_score".to_string(), retrieve.metrics.score);
            refs.extend(retrieve.citations.iter());
        }
        if let Some(generate) = &report.generate {
            metrics.insert("gen_score".to_string(), generate.gen_metrics.gen_score);
            metrics.insert("cit_density".to_string(), generate.gen_metrics.cit_density);
            metrics.insert("lint_major".to_string(), generate.gen_metrics.lint_major as f64);
            refs.extend(generate.rag_refs.iter());
        }

        let output = report
            .generate
            .as_ref()
            .map(|g| g.text.as_str())
            .or_else(|| report.retrieve.as_ref().map(|r| r.normalized_content.as_str()))
            .map(traced_output);

        Self {
            run_id: report.run_id,
            component: COMPONENT.to_string(),
            started_at: started_at.to_rfc3339(),
            ended_at: ended_at.to_rfc3339(),
            ok: report.ok,
            degraded: report.degraded,
            plan: report.plan.clone(),
            stages: report.trace.clone(),
            refs: compact_refs(refs),
            metrics,
            output,
        }
    }

    /// File the trace is written to inside `dir`
    #[inline]
    #[must_use]
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.run_id))
    }

    /// Write the trace as pretty JSON, creating `dir` if needed
    pub async fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = self.path_in(dir);
        let body = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Deduplicate by source and page, keeping the first occurrence
fn compact_refs<'a>(refs: impl IntoIterator<Item = &'a Citation>) -> Vec<TracedRef> {
    let mut out: Vec<TracedRef> = Vec::new();
    for citation in refs {
        if out
            .iter()
            .any(|r| r.source == citation.source && r.page == citation.page)
        {
            continue;
        }
        out.push(TracedRef {
            source: citation.source.clone(),
            page: citation.page.clone(),
            score: citation.score,
            snippet: clip(&citation.snippet, SNIPPET_CHARS),
        });
    }
    out
}

fn traced_output(text: &str) -> TracedOutput {
    TracedOutput {
        preview: clip(text, PREVIEW_CHARS),
        chars: text.chars().count(),
        sha256: hex::encode(Sha256::digest(text.as_bytes())),
    }
}
