//! Issues and validation reports.

use serde::{Deserialize, Serialize};

/// Whether an issue stops the document from passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Advisory,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Blocking => "blocking",
            Severity::Advisory => "advisory",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single rule violation found in a draft. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Raised by the validator itself because the rule could not be evaluated
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl Issue {
    pub fn new(rule_id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            message: message.into(),
            evidence: None,
            synthetic: false,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    /// Advisory issue standing in for a rule that failed to evaluate.
    pub fn evaluation_failure(rule_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        let rule_id = rule_id.into();
        Self {
            message: format!("Rule '{}' could not be evaluated: {}", rule_id, reason),
            rule_id,
            severity: Severity::Advisory,
            evidence: None,
            synthetic: true,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

/// Outcome of one validation pass. `ok` is true iff no blocking issue exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn from_issues(issues: Vec<Issue>) -> Self {
        Self {
            ok: !issues.iter().any(Issue::is_blocking),
            issues,
        }
    }

    pub fn pass() -> Self {
        Self::from_issues(Vec::new())
    }

    pub fn blocking_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_blocking()).count()
    }

    pub fn advisory_count(&self) -> usize {
        self.issues.len() - self.blocking_count()
    }

    /// Issues worth reviewing and healing; excludes evaluation failures.
    pub fn actionable_issues(&self) -> Vec<Issue> {
        self.issues.iter().filter(|i| !i.synthetic).cloned().collect()
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::pass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_pass() {
        let report = ValidationReport::pass();
        assert!(report.ok);
        assert!(!report.has_issues());
    }

    #[test]
    fn test_advisory_only_report_is_ok() {
        let report = ValidationReport::from_issues(vec![Issue::new("tone", Severity::Advisory, "Too informal")]);
        assert!(report.ok);
        assert_eq!(report.advisory_count(), 1);
        assert_eq!(report.blocking_count(), 0);
    }

    #[test]
    fn test_blocking_issue_fails_report() {
        let report = ValidationReport::from_issues(vec![
            Issue::new("tone", Severity::Advisory, "Too informal"),
            Issue::new("required-sections", Severity::Blocking, "Missing required section: Goals"),
        ]);
        assert!(!report.ok);
        assert_eq!(report.blocking_count(), 1);
        assert_eq!(report.advisory_count(), 1);
    }

    #[test]
    fn test_evaluation_failure_is_advisory_and_synthetic() {
        let issue = Issue::evaluation_failure("broken-rule", "boom");
        assert_eq!(issue.severity, Severity::Advisory);
        assert!(issue.synthetic);
        assert!(issue.message.contains("broken-rule"));
        assert!(issue.message.contains("boom"));

        let report = ValidationReport::from_issues(vec![issue]);
        assert!(report.ok);
        assert!(report.actionable_issues().is_empty());
    }

    #[test]
    fn test_issue_serialization_omits_defaults() {
        let issue = Issue::new("r1", Severity::Blocking, "msg");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["ruleId"], "r1");
        assert!(json.get("evidence").is_none());
        assert!(json.get("synthetic").is_none());

        let issue = issue.with_evidence("TBD");
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["evidence"], "TBD");
    }
}
