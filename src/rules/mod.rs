//! Rule packs - declarative, versioned bundles of structure and content rules
//!
//! This module provides:
//! - PackDocument / RuleDefinition / HealPolicy, the on-disk format
//! - RulePack, the validated and compiled form shared by all requests
//! - EvaluatorRegistry, mapping rule kinds to evaluator factories
//! - The built-in evaluators

pub mod evaluators;
pub mod pack;
pub mod registry;

pub use evaluators::{Finding, RuleError, RuleEvaluator};
pub use pack::{
    CompiledRule, DEFAULT_MAX_ATTEMPTS, HARD_MAX_ATTEMPTS, HealPolicy, PackDocument, PackError, RuleDefinition, RulePack,
};
pub use registry::{EvaluatorFactory, EvaluatorRegistry};
