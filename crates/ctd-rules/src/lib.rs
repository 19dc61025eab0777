//! CTD rule sets and structural linting
//!
//! The declarative half of CTDMate: what a section draft must contain and how
//! a parsed draft is checked against it.
//!
//! # Core Pieces
//!
//! - **Section**: CTD section identifiers with lenient parsing
//! - **RuleSet**: compiled checklist (required fields, severities, patterns,
//!   value sets, conditional policies, red flags)
//! - **DocumentInstance**: parsed key-value draft (YAML / JSON / markdown)
//! - **Validator**: deterministic lint producing `(pass, issues)`
//! - **RuleSetCache**: moka-backed cache of compiled rule files
//!
//! # Architecture
//!
//! ```text
//! rules.yaml → RuleSet::load → Arc<RuleSet> ─┐
//!                                            ├→ Validator::lint → LintReport
//! model text → DocumentInstance::from_text ──┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ctd_rules::prelude::*;
//! use std::sync::Arc;
//!
//! let rules = Arc::new(RuleSet::from_yaml_str(RULES)?);
//! let doc = DocumentInstance::from_text(model_output, OutputFormat::Yaml)?;
//! let report = Validator::new(rules).lint(&doc, Section::NonclinicalSummary, false);
//! assert!(report.pass);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cache;
pub mod document;
pub mod error;
pub mod lint;
pub mod ruleset;
pub mod section;

pub use cache::RuleSetCache;
pub use document::{DocumentInstance, OutputFormat};
pub use error::{DocumentError, RuleSetError, RuleSetResult, RulesError};
pub use lint::{lint, Issue, IssueReason, LintReport, Validator};
pub use ruleset::{RuleGroup, RuleSet, Severity, TermRule};
pub use section::Section;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with rule sets
    pub use crate::document::{DocumentInstance, OutputFormat};
    pub use crate::error::{DocumentError, RuleSetError};
    pub use crate::lint::{Issue, IssueReason, LintReport, Validator};
    pub use crate::ruleset::{RuleSet, Severity};
    pub use crate::section::Section;
}
