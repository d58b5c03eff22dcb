//! Healing instructions built from confirmed issues.
//!
//! When a draft fails, the confirmed issues are turned into one follow-up
//! user turn that the drafter can act on. The output is a pure function of
//! the issue list and the pack, so it can be snapshot-tested.

use std::fmt::Write as _;

use super::report::{Issue, Severity};
use crate::rules::RulePack;

/// Evidence excerpts quoted per rule.
pub const MAX_EVIDENCE_PER_RULE: usize = 3;

/// Issues of one rule, in first-seen order.
#[derive(Debug)]
struct RuleGroup<'a> {
    rule_id: &'a str,
    severity: Severity,
    messages: Vec<&'a str>,
    evidence: Vec<&'a str>,
    total: usize,
}

fn group(issues: &[Issue]) -> Vec<RuleGroup<'_>> {
    let mut groups: Vec<RuleGroup<'_>> = Vec::new();
    for issue in issues.iter().filter(|i| !i.synthetic) {
        let index = match groups.iter().position(|g| g.rule_id == issue.rule_id) {
            Some(index) => index,
            None => {
                groups.push(RuleGroup {
                    rule_id: &issue.rule_id,
                    severity: issue.severity,
                    messages: Vec::new(),
                    evidence: Vec::new(),
                    total: 0,
                });
                groups.len() - 1
            }
        };
        let g = &mut groups[index];
        g.total += 1;
        if issue.is_blocking() {
            g.severity = Severity::Blocking;
        }
        if !g.messages.contains(&issue.message.as_str()) {
            g.messages.push(&issue.message);
        }
        if let Some(evidence) = issue.evidence.as_deref()
            && g.evidence.len() < MAX_EVIDENCE_PER_RULE
            && !g.evidence.contains(&evidence)
        {
            g.evidence.push(evidence);
        }
    }
    groups
}

fn write_group(out: &mut String, g: &RuleGroup<'_>, pack: &RulePack) {
    let definition = pack.rule(g.rule_id);
    let _ = write!(out, "- **{}**", g.rule_id);
    if let Some(description) = definition.and_then(|d| d.description.as_deref()) {
        let _ = write!(out, " ({})", description);
    }
    if g.total > 1 {
        let _ = write!(out, ", {} occurrences", g.total);
    }
    out.push('\n');

    for message in &g.messages {
        let _ = writeln!(out, "  - {}", message);
    }
    for evidence in &g.evidence {
        let _ = writeln!(out, "  - Found: \"{}\"", evidence);
    }
    if let Some(guidance) = definition.and_then(|d| d.guidance.as_deref()) {
        let _ = writeln!(out, "  - How to fix: {}", guidance);
    }
}

/// Turn confirmed issues into one revision instruction.
///
/// Issues are grouped by rule (first-appearance order), identical messages
/// collapse, blocking groups come before advisory ones. Synthetic issues are
/// ignored.
pub fn aggregate(issues: &[Issue], pack: &RulePack) -> String {
    let groups = group(issues);
    let count: usize = groups.iter().map(|g| g.total).sum();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Your previous draft did not pass review. Fix the following {} across {} rule{}:",
        if count == 1 { "1 issue".to_string() } else { format!("{} issues", count) },
        groups.len(),
        if groups.len() == 1 { "" } else { "s" }
    );

    for (severity, heading) in [
        (Severity::Blocking, "Must fix"),
        (Severity::Advisory, "Should fix"),
    ] {
        let selected: Vec<&RuleGroup<'_>> = groups.iter().filter(|g| g.severity == severity).collect();
        if selected.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{}:", heading);
        for g in selected {
            write_group(&mut out, g, pack);
        }
    }

    out.push_str(
        "\nReturn the complete revised document, not only the changed parts. \
         Keep everything that already satisfied the rules.",
    );
    out
}

/// Stateless front for callers that hold the aggregator as a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealingAggregator;

impl HealingAggregator {
    pub fn aggregate(&self, issues: &[Issue], pack: &RulePack) -> String {
        aggregate(issues, pack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack() -> RulePack {
        RulePack::builtin().unwrap()
    }

    fn missing(header: &str) -> Issue {
        Issue::new(
            "required-sections",
            Severity::Blocking,
            format!("Missing required section: \"{}\"", header),
        )
    }

    #[test]
    fn test_instruction_names_missing_header() {
        let instruction = aggregate(&[missing("Success Metrics")], &pack());
        assert!(instruction.contains("Success Metrics"));
        assert!(instruction.contains("1 issue across 1 rule:"));
        assert!(instruction.contains("How to fix: Use these exact titles"));
        assert!(instruction.ends_with("Keep everything that already satisfied the rules."));
    }

    #[test]
    fn test_same_rule_grouped_and_deduplicated() {
        let issues = vec![missing("Goals"), missing("Goals"), missing("Open Questions")];
        let instruction = aggregate(&issues, &pack());
        assert_eq!(instruction.matches("**required-sections**").count(), 1);
        assert_eq!(instruction.matches("\"Goals\"").count(), 1);
        assert!(instruction.contains("3 occurrences"));
    }

    #[test]
    fn test_blocking_listed_before_advisory() {
        let issues = vec![
            Issue::new("measurable-metrics", Severity::Advisory, "Section too thin"),
            missing("Goals"),
        ];
        let instruction = aggregate(&issues, &pack());
        let must = instruction.find("Must fix:").unwrap();
        let should = instruction.find("Should fix:").unwrap();
        assert!(must < should);
        assert!(instruction.find("required-sections").unwrap() < should);
    }

    #[test]
    fn test_evidence_capped_per_rule() {
        let issues: Vec<Issue> = (0..5)
            .map(|i| {
                Issue::new("no-placeholders", Severity::Blocking, "Placeholder text left in the document")
                    .with_evidence(format!("...TBD {}...", i))
            })
            .collect();
        let instruction = aggregate(&issues, &pack());
        assert_eq!(instruction.matches("Found:").count(), MAX_EVIDENCE_PER_RULE);
        assert!(instruction.contains("5 occurrences"));
    }

    #[test]
    fn test_synthetic_issues_ignored() {
        let issues = vec![Issue::evaluation_failure("broken", "boom"), missing("Goals")];
        let instruction = aggregate(&issues, &pack());
        assert!(!instruction.contains("broken"));
        assert!(instruction.contains("1 issue across 1 rule:"));
    }

    #[test]
    fn test_unknown_rule_still_reported() {
        let issues = vec![Issue::new("custom", Severity::Blocking, "Custom failure")];
        let instruction = aggregate(&issues, &pack());
        assert!(instruction.contains("- **custom**\n  - Custom failure"));
    }

    #[test]
    fn test_aggregate_is_pure() {
        let issues = vec![missing("Goals"), Issue::new("no-preamble", Severity::Advisory, "Preamble")];
        let p = pack();
        assert_eq!(aggregate(&issues, &p), aggregate(&issues, &p));
        assert_eq!(HealingAggregator.aggregate(&issues, &p), aggregate(&issues, &p));
    }
}
