//! Draftwright - streams rule-validated, self-healing document drafts
//!
//! A drafting model turns a specification into a document. Every draft is
//! checked against a rule pack, findings are double-checked by an AI
//! self-review, and confirmed issues are fed back as a healing turn until the
//! draft passes or the attempt budget runs out. Progress is streamed as
//! newline-delimited JSON frames.

pub mod error;
pub mod id;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod rules;
pub mod server;
pub mod validation;

pub use error::{DraftwrightError, Result};
