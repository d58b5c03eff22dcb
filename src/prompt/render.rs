//! Prompt Renderer - Render templates with context variables using Handlebars
//!
//! The built-in templates are compiled into the binary. A template directory
//! may override any of them by providing `<name>.hbs`.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{DraftwrightError, Result};
use crate::rules::RulePack;
use crate::validation::Issue;

pub const DRAFT_SYSTEM: &str = "draft_system";
pub const DRAFT_USER: &str = "draft_user";
pub const SELF_REVIEW: &str = "self_review";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (DRAFT_SYSTEM, include_str!("templates/draft_system.hbs")),
    (DRAFT_USER, include_str!("templates/draft_user.hbs")),
    (SELF_REVIEW, include_str!("templates/self_review.hbs")),
];

#[derive(Debug, Serialize)]
struct RuleSummary<'a> {
    id: &'a str,
    severity: &'a str,
    description: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DraftSystemContext<'a> {
    required_headers: Vec<String>,
    rules: Vec<RuleSummary<'a>>,
    knowledge: Option<&'a str>,
    research: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DraftUserContext<'a> {
    spec_text: &'a str,
}

#[derive(Debug, Serialize)]
struct NumberedIssue<'a> {
    number: usize,
    rule_id: &'a str,
    severity: &'a str,
    message: &'a str,
    evidence: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ReviewContext<'a> {
    draft: &'a str,
    issues: Vec<NumberedIssue<'a>>,
}

/// Renders prompt templates using Handlebars templating
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    /// A renderer with the built-in templates registered. A built-in that
    /// fails to compile is logged and surfaces later as a render error; use
    /// [`PromptRenderer::try_new`] to fail up front instead.
    pub fn new() -> Self {
        let mut renderer = Self::empty();
        for (name, source) in BUILTIN_TEMPLATES {
            if let Err(e) = renderer.register_template(name, source) {
                tracing::error!(template = name, error = %e, "Built-in template failed to compile");
            }
        }
        renderer
    }

    /// A renderer with the built-in templates registered, or the first
    /// compile error among them.
    pub fn try_new() -> Result<Self> {
        let mut renderer = Self::empty();
        for (name, source) in BUILTIN_TEMPLATES {
            renderer.register_template(name, source)?;
        }
        Ok(renderer)
    }

    fn empty() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // Prompts are plain text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Override built-in templates with `<name>.hbs` files found in `dir`
    pub fn with_overrides(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        for (name, _) in BUILTIN_TEMPLATES {
            let path = dir.join(format!("{}.hbs", name));
            if !path.is_file() {
                continue;
            }
            let source = std::fs::read_to_string(&path)?;
            self.register_template(name, &source)?;
            tracing::info!(template = name, path = %path.display(), "Prompt template overridden");
        }
        Ok(self)
    }

    /// Register a named template for later use
    pub fn register_template(&mut self, name: &str, template: &str) -> Result<()> {
        self.handlebars
            .register_template_string(name, template)
            .map_err(|e| DraftwrightError::Prompt(format!("Failed to register template '{}': {}", name, e)))
    }

    /// Check if a named template is registered
    pub fn has_template(&self, name: &str) -> bool {
        self.handlebars.get_template(name).is_some()
    }

    /// Render a registered template with any serializable context
    pub fn render_with<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        self.handlebars
            .render(name, context)
            .map_err(|e| DraftwrightError::Prompt(format!("Failed to render template '{}': {}", name, e)))
    }

    /// System prompt for drafting: structure, rules and optional context
    pub fn draft_system(&self, pack: &RulePack, knowledge: Option<&str>, research: Option<&str>) -> Result<String> {
        let rules = pack
            .rules()
            .iter()
            .map(|r| RuleSummary {
                id: &r.definition.id,
                severity: r.definition.severity.as_str(),
                description: r.definition.description.as_deref(),
            })
            .collect();
        let context = DraftSystemContext {
            required_headers: pack.required_headers(),
            rules,
            knowledge: knowledge.filter(|k| !k.trim().is_empty()),
            research: research.filter(|r| !r.trim().is_empty()),
        };
        self.render_with(DRAFT_SYSTEM, &context)
    }

    /// First user turn carrying the caller's specification
    pub fn draft_user(&self, spec_text: &str) -> Result<String> {
        self.render_with(DRAFT_USER, &DraftUserContext { spec_text })
    }

    /// Self-review prompt; issues are numbered from 1 in the given order
    pub fn self_review(&self, draft: &str, issues: &[Issue]) -> Result<String> {
        let issues = issues
            .iter()
            .enumerate()
            .map(|(i, issue)| NumberedIssue {
                number: i + 1,
                rule_id: &issue.rule_id,
                severity: issue.severity.as_str(),
                message: &issue.message,
                evidence: issue.evidence.as_deref(),
            })
            .collect();
        self.render_with(SELF_REVIEW, &ReviewContext { draft, issues })
    }
}

impl std::fmt::Debug for PromptRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlebars.get_templates().keys().collect();
        names.sort();
        f.debug_struct("PromptRenderer").field("templates", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Severity;

    #[test]
    fn test_builtins_registered() {
        let renderer = PromptRenderer::new();
        assert!(renderer.has_template(DRAFT_SYSTEM));
        assert!(renderer.has_template(DRAFT_USER));
        assert!(renderer.has_template(SELF_REVIEW));
        assert!(!renderer.has_template("nonexistent"));
    }

    #[test]
    fn test_every_builtin_compiles() {
        let renderer = PromptRenderer::try_new().unwrap();
        for (name, _) in BUILTIN_TEMPLATES {
            assert!(renderer.has_template(name), "{} not registered", name);
        }
    }

    #[test]
    fn test_draft_system_lists_sections_and_rules() {
        let pack = RulePack::builtin().unwrap();
        let prompt = PromptRenderer::new().draft_system(&pack, None, None).unwrap();
        assert!(prompt.contains("- Problem Statement"));
        assert!(prompt.contains("[blocking] no-placeholders"));
        assert!(!prompt.contains("Reference material"));
    }

    #[test]
    fn test_draft_system_includes_knowledge_without_escaping() {
        let pack = RulePack::builtin().unwrap();
        let prompt = PromptRenderer::new()
            .draft_system(&pack, Some("Latency < 200ms & \"fast\""), Some("   "))
            .unwrap();
        assert!(prompt.contains("Reference material"));
        assert!(prompt.contains("Latency < 200ms & \"fast\""));
        assert!(!prompt.contains("Market research"));
    }

    #[test]
    fn test_draft_user_wraps_spec() {
        let prompt = PromptRenderer::new().draft_user("A todo app for teams").unwrap();
        assert!(prompt.contains("<specification>\nA todo app for teams\n</specification>"));
    }

    #[test]
    fn test_self_review_numbers_issues() {
        let issues = vec![
            Issue::new("required-sections", Severity::Blocking, "Missing required section: \"Goals\""),
            Issue::new("no-placeholders", Severity::Blocking, "Placeholder").with_evidence("...TBD..."),
        ];
        let prompt = PromptRenderer::new().self_review("# Doc", &issues).unwrap();
        assert!(prompt.contains("1. [blocking] required-sections: Missing required section: \"Goals\""));
        assert!(prompt.contains("2. [blocking] no-placeholders: Placeholder (evidence: \"...TBD...\")"));
        assert!(prompt.contains("{\"filtered\""));
    }

    #[test]
    fn test_overrides_replace_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("draft_user.hbs"), "SPEC={{spec_text}}").unwrap();
        let renderer = PromptRenderer::new().with_overrides(dir.path()).unwrap();
        assert_eq!(renderer.draft_user("x").unwrap(), "SPEC=x");
        assert!(renderer.draft_system(&RulePack::builtin().unwrap(), None, None).is_ok());
    }

    #[test]
    fn test_bad_override_is_prompt_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("self_review.hbs"), "{{#each issues}}unterminated").unwrap();
        let err = PromptRenderer::new().with_overrides(dir.path()).unwrap_err();
        assert!(matches!(err, DraftwrightError::Prompt(_)));
    }
}
