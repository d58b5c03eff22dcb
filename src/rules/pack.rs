//! Rule pack documents, structural self-validation and compilation.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::evaluators::RuleEvaluator;
use super::registry::EvaluatorRegistry;
use crate::validation::Severity;

/// No request may run more attempts than this, whatever the pack or caller asks.
pub const HARD_MAX_ATTEMPTS: u32 = 5;

/// Attempts used when neither the pack nor the caller says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const BUILTIN_PACK: &str = include_str!("default_pack.json");

/// Structural problems that make a pack unusable.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("failed to read rule pack {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse rule pack: {0}")]
    Parse(String),

    #[error("rule pack field '{0}' must not be empty")]
    MissingField(&'static str),

    #[error("rule pack defines no rules")]
    Empty,

    #[error("rule #{index} has an empty id")]
    EmptyRuleId { index: usize },

    #[error("duplicate rule id '{0}'")]
    DuplicateRuleId(String),

    #[error("rule '{rule_id}' uses unknown kind '{kind}'")]
    UnknownKind { rule_id: String, kind: String },

    #[error("rule '{rule_id}' has invalid params: {reason}")]
    InvalidParams { rule_id: String, reason: String },

    #[error("invalid heal policy: {0}")]
    InvalidHealPolicy(String),
}

/// Retry budget configured by the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealPolicy {
    pub default_max_attempts: u32,
    pub max_attempts: u32,
}

impl Default for HealPolicy {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_attempts: HARD_MAX_ATTEMPTS,
        }
    }
}

impl HealPolicy {
    fn check(&self) -> Result<(), PackError> {
        if self.max_attempts == 0 || self.max_attempts > HARD_MAX_ATTEMPTS {
            return Err(PackError::InvalidHealPolicy(format!(
                "maxAttempts must be between 1 and {}, got {}",
                HARD_MAX_ATTEMPTS, self.max_attempts
            )));
        }
        if self.default_max_attempts == 0 || self.default_max_attempts > self.max_attempts {
            return Err(PackError::InvalidHealPolicy(format!(
                "defaultMaxAttempts must be between 1 and maxAttempts ({}), got {}",
                self.max_attempts, self.default_max_attempts
            )));
        }
        Ok(())
    }
}

/// One rule as written in the pack document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Extra advice appended to healing instructions for this rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// The pack document as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackDocument {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub heal_policy: HealPolicy,
    pub rules: Vec<RuleDefinition>,
}

impl PackDocument {
    pub fn from_json(json: &str) -> Result<Self, PackError> {
        serde_json::from_str(json).map_err(|e| PackError::Parse(e.to_string()))
    }
}

/// A rule with its evaluator resolved.
pub struct CompiledRule {
    pub definition: RuleDefinition,
    pub evaluator: Box<dyn RuleEvaluator>,
}

impl std::fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRule")
            .field("id", &self.definition.id)
            .field("kind", &self.definition.kind)
            .finish()
    }
}

/// Immutable, validated rule pack shared read-only by every request.
#[derive(Debug)]
pub struct RulePack {
    id: String,
    version: String,
    description: Option<String>,
    heal_policy: HealPolicy,
    rules: Vec<CompiledRule>,
    fingerprint: String,
}

impl RulePack {
    /// Validate a document and resolve every rule against the registry.
    pub fn compile(document: PackDocument, registry: &EvaluatorRegistry) -> Result<Self, PackError> {
        if document.id.trim().is_empty() {
            return Err(PackError::MissingField("id"));
        }
        if document.version.trim().is_empty() {
            return Err(PackError::MissingField("version"));
        }
        if document.rules.is_empty() {
            return Err(PackError::Empty);
        }
        document.heal_policy.check()?;

        let fingerprint = fingerprint(&document)?;

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(document.rules.len());
        for (index, definition) in document.rules.into_iter().enumerate() {
            if definition.id.trim().is_empty() {
                return Err(PackError::EmptyRuleId { index });
            }
            if !seen.insert(definition.id.clone()) {
                return Err(PackError::DuplicateRuleId(definition.id));
            }
            let factory = registry.get(&definition.kind).ok_or_else(|| PackError::UnknownKind {
                rule_id: definition.id.clone(),
                kind: definition.kind.clone(),
            })?;
            let evaluator = factory(&definition.params).map_err(|reason| PackError::InvalidParams {
                rule_id: definition.id.clone(),
                reason,
            })?;
            rules.push(CompiledRule { definition, evaluator });
        }

        tracing::info!(
            pack = %document.id,
            version = %document.version,
            rules = rules.len(),
            fingerprint = %fingerprint,
            "Rule pack loaded"
        );

        Ok(Self {
            id: document.id,
            version: document.version,
            description: document.description,
            heal_policy: document.heal_policy,
            rules,
            fingerprint,
        })
    }

    pub fn from_json(json: &str, registry: &EvaluatorRegistry) -> Result<Self, PackError> {
        Self::compile(PackDocument::from_json(json)?, registry)
    }

    pub fn from_file<P: AsRef<Path>>(path: P, registry: &EvaluatorRegistry) -> Result<Self, PackError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| PackError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&json, registry)
    }

    /// The pack compiled into the binary, with the built-in evaluators.
    pub fn builtin() -> Result<Self, PackError> {
        Self::from_json(BUILTIN_PACK, &EvaluatorRegistry::with_builtins())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn heal_policy(&self) -> HealPolicy {
        self.heal_policy
    }

    /// Rules in definition order.
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&RuleDefinition> {
        self.rules.iter().map(|r| &r.definition).find(|d| d.id == id)
    }

    /// Hex SHA-256 of the pack document.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Headings demanded by `required-sections` rules, in order.
    pub fn required_headers(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|r| r.definition.kind == super::evaluators::RequiredSections::KIND)
            .filter_map(|r| r.definition.params.get("headers").and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_str)
            .map(|h| h.trim().trim_start_matches('#').trim().to_string())
            .collect()
    }

    /// Attempt budget for a request: the caller's value clamped to
    /// `[1, HARD_MAX_ATTEMPTS]`, else the pack default, never above the pack ceiling.
    pub fn effective_max_attempts(&self, requested: Option<i64>) -> u32 {
        let ceiling = self.heal_policy.max_attempts.min(HARD_MAX_ATTEMPTS);
        let wanted = match requested {
            Some(n) => n.clamp(1, HARD_MAX_ATTEMPTS as i64) as u32,
            None => self.heal_policy.default_max_attempts,
        };
        wanted.clamp(1, ceiling)
    }
}

fn fingerprint(document: &PackDocument) -> Result<String, PackError> {
    let canonical = serde_json::to_vec(document).map_err(|e| PackError::Parse(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(rules: Value) -> PackDocument {
        serde_json::from_value(json!({
            "id": "test-pack",
            "version": "1.0.0",
            "rules": rules
        }))
        .unwrap()
    }

    fn sections_rule(id: &str) -> Value {
        json!({
            "id": id,
            "kind": "required-sections",
            "severity": "blocking",
            "params": {"headers": ["Overview"]}
        })
    }

    #[test]
    fn test_builtin_pack_compiles() {
        let pack = RulePack::builtin().unwrap();
        assert!(!pack.rules().is_empty());
        assert_eq!(pack.heal_policy().default_max_attempts, 3);
        assert_eq!(pack.fingerprint().len(), 64);
        assert!(pack.required_headers().contains(&"Overview".to_string()));
    }

    #[test]
    fn test_heal_policy_defaults_when_omitted() {
        let pack = RulePack::compile(doc(json!([sections_rule("r1")])), &EvaluatorRegistry::with_builtins()).unwrap();
        assert_eq!(pack.heal_policy(), HealPolicy::default());
    }

    #[test]
    fn test_duplicate_rule_ids_rejected() {
        let err = RulePack::compile(
            doc(json!([sections_rule("r1"), sections_rule("r1")])),
            &EvaluatorRegistry::with_builtins(),
        )
        .unwrap_err();
        assert!(matches!(err, PackError::DuplicateRuleId(id) if id == "r1"));
    }

    #[test]
    fn test_empty_rule_id_rejected() {
        let err = RulePack::compile(doc(json!([sections_rule(" ")])), &EvaluatorRegistry::with_builtins())
            .unwrap_err();
        assert!(matches!(err, PackError::EmptyRuleId { index: 0 }));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = RulePack::compile(
            doc(json!([{"id": "x", "kind": "telepathy", "severity": "advisory"}])),
            &EvaluatorRegistry::with_builtins(),
        )
        .unwrap_err();
        assert!(matches!(err, PackError::UnknownKind { .. }));
    }

    #[test]
    fn test_missing_params_rejected() {
        let err = RulePack::compile(
            doc(json!([{"id": "x", "kind": "required-sections", "severity": "blocking"}])),
            &EvaluatorRegistry::with_builtins(),
        )
        .unwrap_err();
        assert!(matches!(err, PackError::InvalidParams { rule_id, .. } if rule_id == "x"));
    }

    #[test]
    fn test_empty_pack_rejected() {
        let err = RulePack::compile(doc(json!([])), &EvaluatorRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, PackError::Empty));
    }

    #[test]
    fn test_blank_version_rejected() {
        let mut document = doc(json!([sections_rule("r1")]));
        document.version = "".to_string();
        let err = RulePack::compile(document, &EvaluatorRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, PackError::MissingField("version")));
    }

    #[test]
    fn test_invalid_heal_policy_rejected() {
        let mut document = doc(json!([sections_rule("r1")]));
        document.heal_policy = HealPolicy {
            default_max_attempts: 4,
            max_attempts: 2,
        };
        assert!(matches!(
            RulePack::compile(document.clone(), &EvaluatorRegistry::with_builtins()),
            Err(PackError::InvalidHealPolicy(_))
        ));

        document.heal_policy = HealPolicy {
            default_max_attempts: 1,
            max_attempts: 9,
        };
        assert!(matches!(
            RulePack::compile(document, &EvaluatorRegistry::with_builtins()),
            Err(PackError::InvalidHealPolicy(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = RulePack::from_json("{\"id\": ", &EvaluatorRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, PackError::Parse(_)));
    }

    #[test]
    fn test_effective_max_attempts_clamping() {
        let pack = RulePack::compile(doc(json!([sections_rule("r1")])), &EvaluatorRegistry::with_builtins()).unwrap();
        assert_eq!(pack.effective_max_attempts(None), 3);
        assert_eq!(pack.effective_max_attempts(Some(1)), 1);
        assert_eq!(pack.effective_max_attempts(Some(0)), 1);
        assert_eq!(pack.effective_max_attempts(Some(-7)), 1);
        assert_eq!(pack.effective_max_attempts(Some(5)), 5);
        assert_eq!(pack.effective_max_attempts(Some(50)), 5);
    }

    #[test]
    fn test_effective_max_attempts_respects_pack_ceiling() {
        let mut document = doc(json!([sections_rule("r1")]));
        document.heal_policy = HealPolicy {
            default_max_attempts: 2,
            max_attempts: 2,
        };
        let pack = RulePack::compile(document, &EvaluatorRegistry::with_builtins()).unwrap();
        assert_eq!(pack.effective_max_attempts(None), 2);
        assert_eq!(pack.effective_max_attempts(Some(4)), 2);
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let registry = EvaluatorRegistry::with_builtins();
        let a = RulePack::compile(doc(json!([sections_rule("r1")])), &registry).unwrap();
        let b = RulePack::compile(doc(json!([sections_rule("r1")])), &registry).unwrap();
        let c = RulePack::compile(doc(json!([sections_rule("r2")])), &registry).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_from_file_missing_path() {
        let err = RulePack::from_file("/definitely/not/here.json", &EvaluatorRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, PackError::Io { .. }));
    }
}
