//! Prompt System - Handlebars rendering of the drafting and review prompts

mod render;

pub use render::{DRAFT_SYSTEM, DRAFT_USER, PromptRenderer, SELF_REVIEW};
