//! AI self-review of rule findings.
//!
//! The rule engine matches text mechanically and can misfire. A second LLM
//! call classifies each issue as a real defect (confirmed) or a false
//! positive (filtered). Review is an optimization: any failure of the call
//! fails open and every issue is treated as confirmed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

use super::report::Issue;
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::prompt::PromptRenderer;

const REVIEW_SYSTEM_PROMPT: &str =
    "You are a meticulous editor auditing an automated document checker. Answer only with the requested JSON.";

/// Why a review call produced no usable verdict.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Review timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed review response: {0}")]
    Malformed(String),

    #[error("Review prompt failed: {0}")]
    Prompt(String),
}

/// Result of reviewing one issue list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub confirmed: Vec<Issue>,
    pub filtered: Vec<Issue>,
    /// The review call failed and every issue was confirmed unchecked
    pub failed_open: bool,
    pub duration: Duration,
}

impl ReviewOutcome {
    fn confirm_all(issues: Vec<Issue>, failed_open: bool, duration: Duration) -> Self {
        Self {
            confirmed: issues,
            filtered: Vec::new(),
            failed_open,
            duration,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    filtered: Vec<i64>,
}

/// Extract the 0-based indices of filtered issues from the model's reply.
///
/// Tolerates code fences and prose around one JSON object. Numbers must be
/// 1-based, in range and unique.
pub fn parse_verdict(response: &str, issue_count: usize) -> Result<Vec<usize>, ReviewError> {
    let start = response
        .find('{')
        .ok_or_else(|| ReviewError::Malformed("no JSON object in response".to_string()))?;
    let end = response
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| ReviewError::Malformed("unterminated JSON object".to_string()))?;

    let verdict: Verdict =
        serde_json::from_str(&response[start..=end]).map_err(|e| ReviewError::Malformed(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut indices = Vec::with_capacity(verdict.filtered.len());
    for number in verdict.filtered {
        if number < 1 || number as usize > issue_count {
            return Err(ReviewError::Malformed(format!(
                "issue number {} out of range 1..={}",
                number, issue_count
            )));
        }
        if !seen.insert(number) {
            return Err(ReviewError::Malformed(format!("issue number {} listed twice", number)));
        }
        indices.push(number as usize - 1);
    }
    Ok(indices)
}

/// LLM-backed false-positive filter.
pub struct SelfReviewer {
    client: Option<Arc<dyn LlmClient>>,
    renderer: Arc<PromptRenderer>,
    timeout: Duration,
    max_tokens: u32,
}

impl SelfReviewer {
    pub fn new(client: Arc<dyn LlmClient>, renderer: Arc<PromptRenderer>) -> Self {
        Self {
            client: Some(client),
            renderer,
            timeout: Duration::from_secs(60),
            max_tokens: 512,
        }
    }

    /// A reviewer that confirms every issue without calling a model
    pub fn disabled() -> Self {
        Self {
            client: None,
            renderer: Arc::new(PromptRenderer::new()),
            timeout: Duration::from_secs(60),
            max_tokens: 512,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Classify `issues`; never fails.
    pub async fn review(&self, draft: &str, issues: Vec<Issue>) -> ReviewOutcome {
        let start = Instant::now();
        let Some(client) = &self.client else {
            return ReviewOutcome::confirm_all(issues, false, start.elapsed());
        };
        if issues.is_empty() {
            return ReviewOutcome::confirm_all(issues, false, start.elapsed());
        }

        match self.classify(client.as_ref(), draft, &issues).await {
            Ok(filtered_indices) => {
                let filtered_set: HashSet<usize> = filtered_indices.into_iter().collect();
                let (filtered, confirmed): (Vec<(usize, Issue)>, Vec<(usize, Issue)>) =
                    issues.into_iter().enumerate().partition(|(i, _)| filtered_set.contains(i));
                let outcome = ReviewOutcome {
                    confirmed: confirmed.into_iter().map(|(_, issue)| issue).collect(),
                    filtered: filtered.into_iter().map(|(_, issue)| issue).collect(),
                    failed_open: false,
                    duration: start.elapsed(),
                };
                tracing::info!(
                    confirmed = outcome.confirmed.len(),
                    filtered = outcome.filtered.len(),
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Self-review complete"
                );
                outcome
            }
            Err(e) => {
                tracing::warn!(error = %e, issues = issues.len(), "Self-review failed, confirming all issues");
                ReviewOutcome::confirm_all(issues, true, start.elapsed())
            }
        }
    }

    async fn classify(&self, client: &dyn LlmClient, draft: &str, issues: &[Issue]) -> Result<Vec<usize>, ReviewError> {
        let prompt = self
            .renderer
            .self_review(draft, issues)
            .map_err(|e| ReviewError::Prompt(e.to_string()))?;

        let request = CompletionRequest::new(REVIEW_SYSTEM_PROMPT)
            .with_user_message(prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);

        let response = tokio::time::timeout(self.timeout, client.complete(request))
            .await
            .map_err(|_| ReviewError::Timeout(self.timeout))??;

        parse_verdict(&response.content, issues.len())
    }
}

impl std::fmt::Debug for SelfReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfReviewer")
            .field("enabled", &self.is_enabled())
            .field("timeout", &self.timeout)
            .finish()
    }
}
