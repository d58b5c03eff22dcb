//! Runs every rule of a pack against a draft.

use std::panic::{AssertUnwindSafe, catch_unwind};

use super::report::{Issue, ValidationReport};
use crate::rules::{CompiledRule, RulePack};

/// Validate `text` against every rule in `pack`, once each, in definition order.
///
/// A rule that errors or panics yields one synthetic advisory issue instead
/// of aborting the pass.
pub fn validate(text: &str, pack: &RulePack) -> ValidationReport {
    let mut issues = Vec::new();
    for rule in pack.rules() {
        issues.extend(evaluate_rule(rule, text));
    }

    let report = ValidationReport::from_issues(issues);
    tracing::debug!(
        pack = pack.id(),
        ok = report.ok,
        blocking = report.blocking_count(),
        advisory = report.advisory_count(),
        "Validation pass complete"
    );
    report
}

fn evaluate_rule(rule: &CompiledRule, text: &str) -> Vec<Issue> {
    let definition = &rule.definition;
    let outcome = catch_unwind(AssertUnwindSafe(|| rule.evaluator.evaluate(text)));

    match outcome {
        Ok(Ok(findings)) => findings
            .into_iter()
            .map(|f| {
                let issue = Issue::new(&definition.id, definition.severity, f.message);
                match f.evidence {
                    Some(evidence) => issue.with_evidence(evidence),
                    None => issue,
                }
            })
            .collect(),
        Ok(Err(e)) => {
            tracing::warn!(rule = %definition.id, error = %e, "Rule evaluation failed");
            vec![Issue::evaluation_failure(&definition.id, e)]
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(rule = %definition.id, reason = %reason, "Rule evaluator panicked");
            vec![Issue::evaluation_failure(&definition.id, format!("evaluator panicked: {}", reason))]
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{EvaluatorRegistry, Finding, RuleError, RuleEvaluator};
    use crate::validation::Severity;
    use serde_json::json;

    struct Failing;

    impl RuleEvaluator for Failing {
        fn evaluate(&self, _text: &str) -> Result<Vec<Finding>, RuleError> {
            Err(RuleError::Evaluation("backend unavailable".to_string()))
        }
    }

    struct Panicking;

    impl RuleEvaluator for Panicking {
        fn evaluate(&self, _text: &str) -> Result<Vec<Finding>, RuleError> {
            panic!("index out of range")
        }
    }

    fn registry() -> EvaluatorRegistry {
        let mut registry = EvaluatorRegistry::with_builtins();
        registry
            .register("failing", |_| Ok(Box::new(Failing) as Box<dyn RuleEvaluator>))
            .register("panicking", |_| Ok(Box::new(Panicking) as Box<dyn RuleEvaluator>));
        registry
    }

    fn pack(rules: serde_json::Value) -> RulePack {
        RulePack::from_json(
            &json!({"id": "t", "version": "1", "rules": rules}).to_string(),
            &registry(),
        )
        .unwrap()
    }

    #[test]
    fn test_missing_header_is_one_blocking_issue() {
        let pack = pack(json!([
            {"id": "sections", "kind": "required-sections", "severity": "blocking",
             "params": {"headers": ["Overview", "Goals"]}}
        ]));
        let report = validate("# PRD\n## Overview\nText\n", &pack);
        assert!(!report.ok);
        assert_eq!(
            report.issues,
            vec![Issue::new("sections", Severity::Blocking, "Missing required section: \"Goals\"")]
        );
    }

    #[test]
    fn test_issues_follow_rule_definition_order() {
        let pack = pack(json!([
            {"id": "tbd", "kind": "forbidden-pattern", "severity": "advisory", "params": {"pattern": "TBD"}},
            {"id": "sections", "kind": "required-sections", "severity": "blocking",
             "params": {"headers": ["Goals"]}}
        ]));
        let report = validate("TBD", &pack);
        let ids: Vec<&str> = report.issues.iter().map(|i| i.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["tbd", "sections"]);
    }

    #[test]
    fn test_failing_and_panicking_rules_are_isolated() {
        let pack = pack(json!([
            {"id": "broken", "kind": "failing", "severity": "blocking"},
            {"id": "crashy", "kind": "panicking", "severity": "blocking"},
            {"id": "sections", "kind": "required-sections", "severity": "blocking",
             "params": {"headers": ["Goals"]}}
        ]));
        let report = validate("## Goals\n", &pack);
        assert!(report.ok);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().all(|i| i.synthetic && i.severity == Severity::Advisory));
        assert!(report.issues[0].message.contains("backend unavailable"));
        assert!(report.issues[1].message.contains("index out of range"));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let pack = RulePack::builtin().unwrap();
        let text = "Here is your PRD\n## Overview\nTBD\nSee FR-9.\n";
        let first = serde_json::to_string(&validate(text, &pack)).unwrap();
        let second = serde_json::to_string(&validate(text, &pack)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_text_does_not_panic() {
        let report = validate("", &RulePack::builtin().unwrap());
        assert!(!report.ok);
    }
}
