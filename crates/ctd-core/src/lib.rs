//! CTDMate core
//!
//! Turns a free-text request into a routed, reference-checked, generated and
//! linted CTD section draft.
//!
//! # Core Pieces
//!
//! - **Router**: keyword heuristics, optionally refined by a decision model
//! - **ReferenceIndex**: term normalisation, placeholder detection and
//!   guideline similarity scoring
//! - **Generator**: grounded drafting with offline fallback and self-lint
//! - **Orchestrator**: runs the stages in order and assembles the report
//!
//! # Architecture
//!
//! ```text
//! request → Router → [Parse] → [ReferenceIndex] → [Generator] → [Validator] → PipelineReport
//!                                   │                  │
//!                          RetrievalBackend     GenerationBackend
//! ```
//!
//! Backends are traits; a missing or failing backend degrades the run instead
//! of aborting it.
//!
//! # Example
//!
//! ```rust,ignore
//! use ctd_core::prelude::*;
//!
//! let orchestrator = Orchestrator::builder(rules)
//!     .config(PipelineConfig::default())
//!     .generation(Some(backend))
//!     .build();
//! let report = orchestrator.run_text("M2.6 non-clinical summary write request").await?;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod backend;
pub mod config;
pub mod error;
pub mod generator;
pub mod normalize;
pub mod pipeline;
pub mod prompts;
pub mod reference;
pub mod router;
pub mod trace;
pub mod types;

pub use backend::{
    ChatMessage, ChatRole, DecisionClient, GenerationBackend, GenerationRequest, ReferenceSnippet, RetrievalBackend,
    RetrievalQuery,
};
pub use config::PipelineConfig;
pub use error::{BackendError, ErrorReport, PipelineError, PipelineResult};
pub use generator::Generator;
pub use normalize::TermNormalizer;
pub use pipeline::{Orchestrator, OrchestratorBuilder};
pub use reference::ReferenceIndex;
pub use router::Router;
pub use trace::RunTrace;
pub use types::{
    Action, Citation, GenerationResult, PipelineReport, PipelineRequest, PlanSource, RouterPlan, RunId, Stage,
    StageStatus, ValidationResult,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running the pipeline
    pub use crate::backend::{DecisionClient, GenerationBackend, RetrievalBackend};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{BackendError, PipelineError, PipelineResult};
    pub use crate::pipeline::Orchestrator;
    pub use crate::types::{PipelineReport, PipelineRequest, RouterPlan};
    pub use ctd_rules::prelude::*;
}
