//! Built-in rule evaluators.
//!
//! Every evaluator is constructed once from its parameter bag and is then a
//! pure function of the candidate text: no side effects, identical output for
//! identical input.

use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Characters of context kept on each side of a match in evidence excerpts.
const EXCERPT_CONTEXT: usize = 40;

/// Default cap on issues reported by a single pattern rule.
const DEFAULT_MAX_MATCHES: usize = 5;

/// A rule violation before the validator stamps rule id and severity on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub message: String,
    pub evidence: Option<String>,
}

impl Finding {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }
}

/// Raised by an evaluator that cannot produce a verdict.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// The one capability every rule shares.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError>;
}

/// Deserialize a parameter bag, reporting problems as plain strings.
pub fn parse_params<P: DeserializeOwned>(params: &Value) -> Result<P, String> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| e.to_string())
}

fn compile(pattern: &str) -> Result<Regex, String> {
    if pattern.is_empty() {
        return Err("pattern must not be empty".to_string());
    }
    Regex::new(pattern).map_err(|e| format!("invalid pattern /{}/: {}", pattern, e))
}

/// Normalize a heading for comparison: drop leading `#`s, trailing `#`s and
/// surrounding whitespace, compare case-insensitively.
fn normalize_heading(heading: &str) -> String {
    heading
        .trim()
        .trim_start_matches('#')
        .trim_end_matches('#')
        .trim()
        .to_lowercase()
}

/// A markdown ATX heading found outside fenced code blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Heading {
    level: usize,
    title: String,
    line: usize,
}

fn headings(text: &str) -> Vec<Heading> {
    let mut found = Vec::new();
    let mut in_fence = false;

    for (line_no, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let level = trimmed.chars().take_while(|&c| c == '#').count();
        if level == 0 || level > 6 {
            continue;
        }
        let rest = &trimmed[level..];
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            continue;
        }
        found.push(Heading {
            level,
            title: normalize_heading(rest),
            line: line_no,
        });
    }

    found
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Single-line excerpt around a byte range, cut on char boundaries.
pub fn excerpt(text: &str, start: usize, end: usize) -> String {
    let mut from = start;
    let mut steps = 0;
    while from > 0 && steps < EXCERPT_CONTEXT {
        from -= 1;
        while !text.is_char_boundary(from) {
            from -= 1;
        }
        steps += 1;
    }

    let mut to = end.min(text.len());
    steps = 0;
    while to < text.len() && steps < EXCERPT_CONTEXT {
        to += 1;
        while !text.is_char_boundary(to) {
            to += 1;
        }
        steps += 1;
    }

    let mut snippet = text[from..to].split_whitespace().collect::<Vec<_>>().join(" ");
    if from > 0 {
        snippet.insert_str(0, "...");
    }
    if to < text.len() {
        snippet.push_str("...");
    }
    snippet
}

/// `required-sections`: each listed heading must appear.
#[derive(Debug)]
pub struct RequiredSections {
    headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequiredSectionsParams {
    headers: Vec<String>,
}

impl RequiredSections {
    pub const KIND: &'static str = "required-sections";

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let p: RequiredSectionsParams = parse_params(params)?;
        if p.headers.is_empty() {
            return Err("headers must list at least one heading".to_string());
        }
        if p.headers.iter().any(|h| normalize_heading(h).is_empty()) {
            return Err("headers must not contain blank entries".to_string());
        }
        Ok(Self { headers: p.headers })
    }
}

impl RuleEvaluator for RequiredSections {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError> {
        let present: HashSet<String> = headings(text).into_iter().map(|h| h.title).collect();
        Ok(self
            .headers
            .iter()
            .filter(|h| !present.contains(&normalize_heading(h)))
            .map(|h| Finding::new(format!("Missing required section: \"{}\"", h.trim())))
            .collect())
    }
}

/// `forbidden-pattern`: every match is a violation.
#[derive(Debug)]
pub struct ForbiddenPattern {
    regex: Regex,
    message: String,
    max_matches: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ForbiddenPatternParams {
    pattern: String,
    message: Option<String>,
    max_matches: Option<usize>,
}

impl ForbiddenPattern {
    pub const KIND: &'static str = "forbidden-pattern";

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let p: ForbiddenPatternParams = parse_params(params)?;
        let regex = compile(&p.pattern)?;
        let max_matches = p.max_matches.unwrap_or(DEFAULT_MAX_MATCHES);
        if max_matches == 0 {
            return Err("maxMatches must be at least 1".to_string());
        }
        Ok(Self {
            message: p
                .message
                .unwrap_or_else(|| format!("Forbidden content matched /{}/", p.pattern)),
            regex,
            max_matches,
        })
    }
}

impl RuleEvaluator for ForbiddenPattern {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError> {
        Ok(self
            .regex
            .find_iter(text)
            .take(self.max_matches)
            .map(|m| Finding::new(&self.message).with_evidence(excerpt(text, m.start(), m.end())))
            .collect())
    }
}

/// `required-pattern`: at least `minCount` matches must occur.
#[derive(Debug)]
pub struct RequiredPattern {
    regex: Regex,
    pattern: String,
    min_count: usize,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RequiredPatternParams {
    pattern: String,
    min_count: Option<usize>,
    message: Option<String>,
}

impl RequiredPattern {
    pub const KIND: &'static str = "required-pattern";

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let p: RequiredPatternParams = parse_params(params)?;
        let min_count = p.min_count.unwrap_or(1);
        if min_count == 0 {
            return Err("minCount must be at least 1".to_string());
        }
        Ok(Self {
            regex: compile(&p.pattern)?,
            pattern: p.pattern,
            min_count,
            message: p.message,
        })
    }
}

impl RuleEvaluator for RequiredPattern {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError> {
        let found = self.regex.find_iter(text).count();
        if found >= self.min_count {
            return Ok(Vec::new());
        }
        let detail = format!(
            "expected at least {} match(es) of /{}/, found {}",
            self.min_count, self.pattern, found
        );
        let message = match &self.message {
            Some(m) => format!("{} ({})", m, detail),
            None => format!("Required content missing: {}", detail),
        };
        Ok(vec![Finding::new(message)])
    }
}

/// `word-count`: bounds on the whole document.
#[derive(Debug)]
pub struct WordCount {
    min: Option<usize>,
    max: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WordCountParams {
    min: Option<usize>,
    max: Option<usize>,
}

impl WordCount {
    pub const KIND: &'static str = "word-count";

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let p: WordCountParams = parse_params(params)?;
        match (p.min, p.max) {
            (None, None) => Err("at least one of min or max is required".to_string()),
            (Some(min), Some(max)) if min > max => Err(format!("min ({}) exceeds max ({})", min, max)),
            _ => Ok(Self { min: p.min, max: p.max }),
        }
    }
}

impl RuleEvaluator for WordCount {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError> {
        let words = word_count(text);
        let mut findings = Vec::new();
        if let Some(min) = self.min {
            if words < min {
                findings.push(Finding::new(format!(
                    "Document is too short: {} words, at least {} required",
                    words, min
                )));
            }
        }
        if let Some(max) = self.max {
            if words > max {
                findings.push(Finding::new(format!(
                    "Document is too long: {} words, at most {} allowed",
                    words, max
                )));
            }
        }
        Ok(findings)
    }
}

/// `section-length`: the body under a heading needs enough words. A missing
/// heading is left to `required-sections`.
#[derive(Debug)]
pub struct SectionLength {
    header: String,
    normalized: String,
    min_words: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SectionLengthParams {
    header: String,
    min_words: usize,
}

impl SectionLength {
    pub const KIND: &'static str = "section-length";

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let p: SectionLengthParams = parse_params(params)?;
        let normalized = normalize_heading(&p.header);
        if normalized.is_empty() {
            return Err("header must not be blank".to_string());
        }
        if p.min_words == 0 {
            return Err("minWords must be at least 1".to_string());
        }
        Ok(Self {
            header: p.header.trim().to_string(),
            normalized,
            min_words: p.min_words,
        })
    }
}

impl RuleEvaluator for SectionLength {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError> {
        let all = headings(text);
        let Some(idx) = all.iter().position(|h| h.title == self.normalized) else {
            return Ok(Vec::new());
        };
        let heading = &all[idx];
        let end_line = all[idx + 1..]
            .iter()
            .find(|h| h.level <= heading.level)
            .map(|h| h.line)
            .unwrap_or(usize::MAX);

        let body_words: usize = text
            .lines()
            .enumerate()
            .filter(|(n, _)| *n > heading.line && *n < end_line)
            .map(|(_, line)| word_count(line))
            .sum();

        if body_words >= self.min_words {
            return Ok(Vec::new());
        }
        Ok(vec![Finding::new(format!(
            "Section \"{}\" is too thin: {} words, at least {} required",
            self.header, body_words, self.min_words
        ))])
    }
}

/// `cross-reference`: every referenced identifier must be defined.
#[derive(Debug)]
pub struct CrossReference {
    definition: Regex,
    reference: Regex,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CrossReferenceParams {
    definition_pattern: String,
    reference_pattern: String,
}

impl CrossReference {
    pub const KIND: &'static str = "cross-reference";

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let p: CrossReferenceParams = parse_params(params)?;
        let definition = compile(&p.definition_pattern)?;
        let reference = compile(&p.reference_pattern)?;
        if definition.captures_len() < 2 || reference.captures_len() < 2 {
            return Err("both patterns need a capture group for the identifier".to_string());
        }
        Ok(Self { definition, reference })
    }
}

impl RuleEvaluator for CrossReference {
    fn evaluate(&self, text: &str) -> Result<Vec<Finding>, RuleError> {
        let defined: HashSet<&str> = self
            .definition
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect();

        let mut reported = HashSet::new();
        let mut findings = Vec::new();
        for caps in self.reference.captures_iter(text) {
            let Some(id) = caps.get(1) else { continue };
            if defined.contains(id.as_str()) || !reported.insert(id.as_str()) {
                continue;
            }
            findings.push(
                Finding::new(format!("Reference \"{}\" is never defined", id.as_str()))
                    .with_evidence(excerpt(text, id.start(), id.end())),
            );
        }
        Ok(findings)
    }
}
