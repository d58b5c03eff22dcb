//! Core LLM client trait, errors and the scripted mock client

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::streaming::StreamChunk;
use super::types::{CompletionRequest, CompletionResponse, StopReason, Usage};
use crate::protocol::ErrorCode;

/// Stateless LLM client - each call is independent (the conversation travels in the request)
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier used for requests
    fn model(&self) -> &str;

    /// Single completion request (blocking until complete)
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion; text deltas are pushed into `chunk_tx` as they arrive.
    /// A closed receiver must not abort the call.
    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;
}

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Missing API key: environment variable {env_var} not set")]
    MissingApiKey { env_var: String },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Event source error: {0}")]
    EventSource(String),

    #[error("Circuit open, provider calls suspended for {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e.to_string())
        } else {
            LlmError::Network(e.to_string())
        }
    }
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. }) || matches!(self, LlmError::ApiError { status: 429, .. })
    }

    /// Transient failures worth another attempt against the provider
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            LlmError::Timeout(_) => true,
            LlmError::Network(_) => true,
            LlmError::EventSource(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::JsonError(_) => false,
            LlmError::MissingApiKey { .. } => false,
            LlmError::CircuitOpen { .. } => false,
        }
    }

    /// Delay the provider asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            LlmError::CircuitOpen { retry_in } => Some(*retry_in),
            _ => None,
        }
    }

    /// Classification into the wire error taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            LlmError::MissingApiKey { .. } => ErrorCode::MissingApiKey,
            LlmError::RateLimited { .. } => ErrorCode::RateLimited,
            LlmError::ApiError { status: 429, .. } => ErrorCode::RateLimited,
            LlmError::ApiError { status: 408, .. } => ErrorCode::NetworkTimeout,
            LlmError::ApiError { status, .. } if *status >= 500 => ErrorCode::ServiceUnavailable,
            LlmError::ApiError { .. } => ErrorCode::UnexpectedError,
            LlmError::Timeout(_) => ErrorCode::NetworkTimeout,
            LlmError::Network(_) | LlmError::EventSource(_) | LlmError::CircuitOpen { .. } => {
                ErrorCode::ServiceUnavailable
            }
            LlmError::InvalidResponse(_) | LlmError::JsonError(_) => ErrorCode::UnexpectedError,
        }
    }
}

/// One scripted reply of the mock client
#[derive(Debug)]
pub enum MockReply {
    /// Stream this text, then finish normally
    Text(String),
    /// Fail before any delta is produced
    Error(LlmError),
    /// Stream `partial`, then fail
    FailMidStream { partial: String, error: LlmError },
}

/// Scripted client for tests and offline runs.
///
/// Replies are consumed in order; once the script is exhausted the repeat
/// text (if any) is returned for every further call.
#[derive(Debug)]
pub struct MockLlmClient {
    model: String,
    script: Mutex<VecDeque<MockReply>>,
    repeat: Option<String>,
    chunk_delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            chunk_delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply with these texts, in order
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for r in responses {
            mock.push(MockReply::Text(r.into()));
        }
        mock
    }

    /// Reply with the same text forever
    pub fn repeating(text: impl Into<String>) -> Self {
        Self {
            repeat: Some(text.into()),
            ..Self::new()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sleep between streamed chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn push(&self, reply: MockReply) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }

    pub fn then_error(self, error: LlmError) -> Self {
        self.push(MockReply::Error(error));
        self
    }

    /// Every request seen so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn next_reply(&self, request: &CompletionRequest) -> MockReply {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (scripted, &self.repeat) {
            (Some(reply), _) => reply,
            (None, Some(text)) => MockReply::Text(text.clone()),
            (None, None) => MockReply::Error(LlmError::InvalidResponse("mock script exhausted".to_string())),
        }
    }

    fn response_for(request: &CompletionRequest, text: String) -> CompletionResponse {
        let input_chars: usize =
            request.system.chars().count() + request.messages.iter().map(|m| m.content.chars().count()).sum::<usize>();
        let output_tokens = text.split_whitespace().count() as u64;
        CompletionResponse {
            content: text,
            stop_reason: StopReason::EndTurn,
            usage: Usage::new((input_chars / 4) as u64, output_tokens),
        }
    }

    async fn send_chunks(&self, text: &str, chunk_tx: &mpsc::Sender<StreamChunk>) {
        for piece in text.split_inclusive(' ') {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            // A dropped receiver only stops forwarding.
            let _ = chunk_tx.send(StreamChunk::TextDelta(piece.to_string())).await;
        }
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self.next_reply(&request) {
            MockReply::Text(text) => Ok(Self::response_for(&request, text)),
            MockReply::Error(error) | MockReply::FailMidStream { error, .. } => Err(error),
        }
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        match self.next_reply(&request) {
            MockReply::Text(text) => {
                self.send_chunks(&text, &chunk_tx).await;
                let response = Self::response_for(&request, text);
                let _ = chunk_tx
                    .send(StreamChunk::MessageDone {
                        stop_reason: response.stop_reason,
                        usage: response.usage,
                    })
                    .await;
                Ok(response)
            }
            MockReply::Error(error) => Err(error),
            MockReply::FailMidStream { partial, error } => {
                self.send_chunks(&partial, &chunk_tx).await;
                Err(error)
            }
        }
    }
}
