//! Orchestrator - the per-request generate/validate/review/heal state machine
//!
//! - `GenerationService` runs preflight checks and owns startup configuration
//! - `Orchestrator` drives one run and writes its frames
//! - `KnowledgeSource` and `ResearchProvider` feed optional context into the prompt

mod context;
mod runner;
mod service;

pub use context::{DirectoryKnowledge, KnowledgeSource, NoKnowledge, NoResearch, ResearchProvider};
pub use runner::{Orchestrator, Pipeline, RunOutcome, RunRequest, RunSummary};
pub use service::{DEFAULT_FRAME_BUFFER, DEFAULT_MAX_SPEC_CHARS, GenerateRequest, GenerationService};
