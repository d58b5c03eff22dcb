//! Typed progress frames streamed to the caller.
//!
//! Every frame serializes as a `{"type": ..., "data": {...}}` envelope. Frames
//! are write-once; the stream is append-only and ends with exactly one
//! terminal frame (`result` or `error`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::Usage;
use crate::validation::ValidationReport;

/// Closed error taxonomy carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Provider credential missing; needs reconfiguration
    MissingApiKey,
    /// Upstream call timed out
    NetworkTimeout,
    /// Upstream unreachable, overloaded or circuit open
    ServiceUnavailable,
    /// Upstream asked us to slow down
    RateLimited,
    /// Rule pack failed structural validation
    ValidationFailed,
    /// Caller sent an unusable request
    InvalidInput,
    /// Anything else
    UnexpectedError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingApiKey => "MISSING_API_KEY",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::UnexpectedError => "UNEXPECTED_ERROR",
        }
    }

    /// Transport-level failures worth retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkTimeout | ErrorCode::ServiceUnavailable | ErrorCode::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Orchestrator state, carried on every `phase` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    LoadingKnowledge,
    PerformingResearch,
    Generating,
    Validating,
    SelfReviewing,
    Healing,
    Done,
    Failed,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::LoadingKnowledge => "loading-knowledge",
            Phase::PerformingResearch => "performing-research",
            Phase::Generating => "generating",
            Phase::Validating => "validating",
            Phase::SelfReviewing => "self-reviewing",
            Phase::Healing => "healing",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Error)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseFrame {
    pub phase: Phase,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFrame {
    pub attempt: u32,
    pub delta: String,
    /// Draft length so far, in Unicode scalar values
    pub accumulated_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFrame {
    pub attempt: u32,
    pub report: ValidationReport,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfReviewFrame {
    pub attempt: u32,
    /// Rule ids of the issues judged real
    pub confirmed: Vec<String>,
    /// Rule ids of the issues judged false positives
    pub filtered: Vec<String>,
    pub failed_open: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingFrame {
    pub attempt: u32,
    pub instruction: String,
    pub issue_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFrame {
    pub success: bool,
    pub draft: String,
    pub attempts: u32,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub usage: Usage,
}

/// Full context of a pipeline failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ErrorDetails {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        phase: Phase,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            phase,
            attempt,
            max_attempts,
            context: None,
            trace: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    pub details: ErrorDetails,
}

impl From<ErrorDetails> for ErrorFrame {
    fn from(details: ErrorDetails) -> Self {
        Self {
            code: details.code,
            message: details.message.clone(),
            recoverable: details.code.is_recoverable(),
            details,
        }
    }
}

/// One record of the NDJSON response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum StreamFrame {
    Phase(PhaseFrame),
    Generation(GenerationFrame),
    Validation(ValidationFrame),
    SelfReview(SelfReviewFrame),
    Healing(HealingFrame),
    Result(ResultFrame),
    Error(ErrorFrame),
}

impl StreamFrame {
    pub fn phase(phase: Phase, attempt: u32, max_attempts: u32) -> Self {
        StreamFrame::Phase(PhaseFrame {
            phase,
            attempt,
            max_attempts,
            message: None,
        })
    }

    pub fn phase_with_message(
        phase: Phase,
        attempt: u32,
        max_attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        StreamFrame::Phase(PhaseFrame {
            phase,
            attempt,
            max_attempts,
            message: Some(message.into()),
        })
    }

    pub fn error(details: ErrorDetails) -> Self {
        StreamFrame::Error(details.into())
    }

    /// The envelope `type` string.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamFrame::Phase(_) => "phase",
            StreamFrame::Generation(_) => "generation",
            StreamFrame::Validation(_) => "validation",
            StreamFrame::SelfReview(_) => "self-review",
            StreamFrame::Healing(_) => "healing",
            StreamFrame::Result(_) => "result",
            StreamFrame::Error(_) => "error",
        }
    }

    /// `result` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Result(_) | StreamFrame::Error(_))
    }
}
