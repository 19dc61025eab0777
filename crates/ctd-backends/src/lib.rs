//! Concrete CTDMate backends
//!
//! - [`ChatClient`]: chat-completion HTTP client, used for drafting and as the
//!   router's decision model
//! - [`LexicalIndex`]: TF-IDF reference index over a guideline corpus file
//!
//! Both implement the `ctd-core` backend traits and can be wired into an
//! `Orchestrator` as `Arc<dyn ...>`.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod chat;
pub mod error;
pub mod lexical;

pub use chat::{ChatClient, ChatClientConfig};
pub use error::{ClientError, CorpusError, CorpusResult};
pub use lexical::{CorpusEntry, LexicalIndex};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
