//! Explicit evaluator registry, keyed by rule kind.
//!
//! Packs resolve every rule against a registry once, at load time. There is
//! no global registration: callers build the registry they want and pass it
//! in, so tests can add their own kinds without touching shared state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::evaluators::{
    CrossReference, ForbiddenPattern, RequiredPattern, RequiredSections, RuleEvaluator, SectionLength, WordCount,
};

/// Builds an evaluator from a rule's parameter bag.
pub type EvaluatorFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn RuleEvaluator>, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    factories: BTreeMap<String, EvaluatorFactory>,
}

impl EvaluatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(RequiredSections::KIND, |p| {
                RequiredSections::from_params(p).map(|e| Box::new(e) as Box<dyn RuleEvaluator>)
            })
            .register(ForbiddenPattern::KIND, |p| {
                ForbiddenPattern::from_params(p).map(|e| Box::new(e) as Box<dyn RuleEvaluator>)
            })
            .register(RequiredPattern::KIND, |p| {
                RequiredPattern::from_params(p).map(|e| Box::new(e) as Box<dyn RuleEvaluator>)
            })
            .register(WordCount::KIND, |p| {
                WordCount::from_params(p).map(|e| Box::new(e) as Box<dyn RuleEvaluator>)
            })
            .register(SectionLength::KIND, |p| {
                SectionLength::from_params(p).map(|e| Box::new(e) as Box<dyn RuleEvaluator>)
            })
            .register(CrossReference::KIND, |p| {
                CrossReference::from_params(p).map(|e| Box::new(e) as Box<dyn RuleEvaluator>)
            });
        registry
    }

    /// Register (or replace) the factory for a kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Box<dyn RuleEvaluator>, String> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&EvaluatorFactory> {
        self.factories.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::evaluators::{Finding, RuleError};
    use serde_json::json;

    struct AlwaysFinds;

    impl RuleEvaluator for AlwaysFinds {
        fn evaluate(&self, _text: &str) -> Result<Vec<Finding>, RuleError> {
            Ok(vec![Finding::new("always")])
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = EvaluatorRegistry::with_builtins();
        assert_eq!(
            registry.kinds(),
            vec![
                "cross-reference",
                "forbidden-pattern",
                "required-pattern",
                "required-sections",
                "section-length",
                "word-count",
            ]
        );
    }

    #[test]
    fn test_empty_registry_has_nothing() {
        let registry = EvaluatorRegistry::new();
        assert!(registry.kinds().is_empty());
        assert!(registry.get("required-sections").is_none());
    }

    #[test]
    fn test_custom_kind_is_isolated_per_registry() {
        let mut custom = EvaluatorRegistry::with_builtins();
        custom.register("always", |_| Ok(Box::new(AlwaysFinds) as Box<dyn RuleEvaluator>));
        assert!(custom.contains("always"));
        assert!(!EvaluatorRegistry::with_builtins().contains("always"));

        let factory = custom.get("always").unwrap();
        let evaluator = factory(&json!({})).unwrap();
        assert_eq!(evaluator.evaluate("anything").unwrap().len(), 1);
    }

    #[test]
    fn test_factory_surfaces_param_errors() {
        let registry = EvaluatorRegistry::with_builtins();
        let factory = registry.get("word-count").unwrap();
        assert!(factory(&json!({})).is_err());
    }
}
