//! Validation - rule checking, AI self-review and healing instructions
//!
//! - `validate` runs a rule pack over a draft and produces a report
//! - `SelfReviewer` filters false positives with a second LLM call (fail-open)
//! - `aggregate` turns confirmed issues into the next conversation turn

pub mod feedback;
pub mod report;
pub mod self_review;
pub mod validator;

pub use feedback::{HealingAggregator, MAX_EVIDENCE_PER_RULE, aggregate};
pub use report::{Issue, Severity, ValidationReport};
pub use self_review::{ReviewError, ReviewOutcome, SelfReviewer, parse_verdict};
pub use validator::validate;
