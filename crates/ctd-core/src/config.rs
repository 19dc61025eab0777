//! Pipeline configuration
//!
//! Thresholds and limits that shape a run. Values come from, in increasing
//! precedence: built-in defaults, an optional TOML file, `CTD_*` environment
//! variables.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunable thresholds and limits for a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Minimum reference coverage for a reference pass
    pub coverage_min: f64,
    /// Minimum retrieval confidence for a reference pass
    pub rag_conf_min: f64,
    /// Maximum summed violation weight for a reference pass
    pub violation_weight_max: u32,
    /// Optional minimum reference score before generation runs
    pub generate_gate: Option<f64>,
    /// Generation score threshold reported alongside results
    pub generate_ready_min: f64,
    /// Maximum major lint issues tolerated in generation metrics
    pub lint_max_major: usize,
    /// Per-call time bound for external backends, in milliseconds
    pub backend_timeout_ms: u64,
    /// Maximum citations kept for generation context
    pub max_refs: usize,
    /// Guidelines fetched per reference-validation query
    pub retrieval_k: usize,
    /// Default for request-level auto-fix
    pub auto_fix: bool,
    /// Language the generated prose should be written in
    pub language: String,
    /// Directory receiving one JSON trace per run; tracing to disk is off when unset
    pub trace_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            coverage_min: 0.70,
            rag_conf_min: 0.40,
            violation_weight_max: 3,
            generate_gate: None,
            generate_ready_min: 0.70,
            lint_max_major: 0,
            backend_timeout_ms: 30_000,
            max_refs: 6,
            retrieval_k: 5,
            auto_fix: true,
            language: "ko".to_string(),
            trace_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With backend timeout
    #[inline]
    #[must_use]
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With generation gate
    #[inline]
    #[must_use]
    pub fn with_generate_gate(mut self, gate: Option<f64>) -> Self {
        self.generate_gate = gate;
        self
    }

    /// With per-run trace directory
    #[inline]
    #[must_use]
    pub fn with_trace_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.trace_dir = dir;
        self
    }

    /// Backend call bound
    #[inline]
    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> PipelineResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| PipelineError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Apply `CTD_*` overrides from the process environment
    pub fn apply_env(self) -> PipelineResult<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `CTD_*` overrides from an arbitrary lookup
    pub fn apply_env_with<F>(mut self, lookup: F) -> PipelineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> PipelineResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| PipelineError::config(format!("{key}: cannot parse '{raw}'")))
        }

        if let Some(v) = lookup("CTD_COVERAGE_MIN") {
            self.coverage_min = parse("CTD_COVERAGE_MIN", &v)?;
        }
        if let Some(v) = lookup("CTD_RAG_CONF_MIN") {
            self.rag_conf_min = parse("CTD_RAG_CONF_MIN", &v)?;
        }
        if let Some(v) = lookup("CTD_VIO_MAX") {
            self.violation_weight_max = parse("CTD_VIO_MAX", &v)?;
        }
        if let Some(v) = lookup("CTD_GENERATE_GATE") {
            self.generate_gate = if v.trim().is_empty() {
                None
            } else {
                Some(parse("CTD_GENERATE_GATE", &v)?)
            };
        }
        if let Some(v) = lookup("CTD_GENERATE_READY_MIN") {
            self.generate_ready_min = parse("CTD_GENERATE_READY_MIN", &v)?;
        }
        if let Some(v) = lookup("CTD_LINT_MAX_MAJOR") {
            self.lint_max_major = parse("CTD_LINT_MAX_MAJOR", &v)?;
        }
        if let Some(v) = lookup("CTD_BACKEND_TIMEOUT_SECS") {
            let secs: u64 = parse("CTD_BACKEND_TIMEOUT_SECS", &v)?;
            self.backend_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(v) = lookup("CTD_BACKEND_TIMEOUT_MS") {
            self.backend_timeout_ms = parse("CTD_BACKEND_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CTD_LANGUAGE") {
            self.language = v;
        }
        if let Some(v) = lookup("CTD_TRACE_DIR") {
            self.trace_dir = Some(v.trim()).filter(|v| !v.is_empty()).map(PathBuf::from);
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values outside their meaningful range
    pub fn validate(&self) -> PipelineResult<()> {
        let unit = [
            ("coverage_min", Some(self.coverage_min)),
            ("rag_conf_min", Some(self.rag_conf_min)),
            ("generate_gate", self.generate_gate),
            ("generate_ready_min", Some(self.generate_ready_min)),
        ];
        for (name, value) in unit {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(PipelineError::config(format!("{name} must be within [0, 1], got {value}")));
                }
            }
        }
        if self.backend_timeout_ms == 0 {
            return Err(PipelineError::config("backend_timeout_ms must be positive"));
        }
        if self.max_refs == 0 || self.retrieval_k == 0 {
            return Err(PipelineError::config("max_refs and retrieval_k must be positive"));
        }
        Ok(())
    }
}
