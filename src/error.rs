//! Error types for Draftwright
//!
//! Centralized error handling using thiserror. Every error classifies itself
//! into the closed [`ErrorCode`] taxonomy carried by `error` frames.

use thiserror::Error;

use crate::llm::LlmError;
use crate::protocol::ErrorCode;
use crate::rules::PackError;

/// All error types that can occur in Draftwright
#[derive(Debug, Error)]
pub enum DraftwrightError {
    /// Rule pack failed structural self-validation
    #[error("Rule pack invalid: {0}")]
    Pack(#[from] PackError),

    /// Upstream generation provider error
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Caller supplied a request the pipeline cannot accept
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Prompt template failed to render
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invariant broken inside the pipeline
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller sent a body that is not the expected JSON
    #[error("Invalid request JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DraftwrightError {
    /// Best-effort classification into the wire error taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            DraftwrightError::Pack(_) => ErrorCode::ValidationFailed,
            DraftwrightError::Llm(e) => e.code(),
            DraftwrightError::InvalidInput(_) | DraftwrightError::Json(_) => ErrorCode::InvalidInput,
            DraftwrightError::Prompt(_)
            | DraftwrightError::Http(_)
            | DraftwrightError::Internal(_)
            | DraftwrightError::Io(_) => ErrorCode::UnexpectedError,
        }
    }

    /// Whether retrying the same request later could succeed
    pub fn is_recoverable(&self) -> bool {
        self.code().is_recoverable()
    }
}

/// Result type alias for Draftwright operations
pub type Result<T> = std::result::Result<T, DraftwrightError>;
