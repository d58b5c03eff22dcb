//! Anthropic API client implementation
//!
//! This module implements the LlmClient trait for the Anthropic Messages API,
//! both as a single JSON round trip and as an SSE stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::HeaderMap;
use reqwest_eventsource::{Event, EventSource, RequestBuilderExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::llm::client::{LlmClient, LlmError};
use crate::llm::streaming::{StreamChunk, StreamParser, parse_sse_event};
use crate::llm::types::{CompletionRequest, CompletionResponse, Role, StopReason, Usage};

/// Anthropic API base URL
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model to use
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default max tokens
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Seconds to wait on a 429 without a usable `retry-after`
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Configuration for the Anthropic client
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub base_url: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(300),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }
}

impl AnthropicConfig {
    /// Create a new config with a specific model
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Read the API key from the named environment variable; blank counts as missing.
pub fn api_key_from_env(env_var: &str) -> Result<String, LlmError> {
    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(LlmError::MissingApiKey {
            env_var: env_var.to_string(),
        }),
    }
}

/// Anthropic API client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    config: AnthropicConfig,
}

impl AnthropicClient {
    /// Create a new Anthropic client, reading ANTHROPIC_API_KEY from environment
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        let api_key = api_key_from_env(API_KEY_ENV)?;
        Self::with_api_key(api_key, config)
    }

    /// Create a client with an explicit API key
    pub fn with_api_key(api_key: impl Into<String>, config: AnthropicConfig) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey {
                env_var: API_KEY_ENV.to_string(),
            });
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, api_key, config })
    }

    /// Build the request body for the Anthropic API
    fn build_request(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content
                })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages
        });

        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    /// Parse the API response into a CompletionResponse
    fn parse_response(body: Value) -> Result<CompletionResponse, LlmError> {
        let stop_reason = body["stop_reason"]
            .as_str()
            .map(StopReason::from_api)
            .unwrap_or_default();

        let usage = body
            .get("usage")
            .map(|u| {
                Usage::new(
                    u["input_tokens"].as_u64().unwrap_or(0),
                    u["output_tokens"].as_u64().unwrap_or(0),
                )
            })
            .unwrap_or_default();

        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| LlmError::InvalidResponse("response has no content array".to_string()))?;

        let content = blocks
            .iter()
            .filter(|b| b["type"].as_str() == Some("text"))
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(CompletionResponse {
            content,
            stop_reason,
            usage,
        })
    }

    fn request_builder(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(&self.config.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    /// Send a request to the Anthropic API
    async fn send_request(&self, body: Value) -> Result<Value, LlmError> {
        let response = self.request_builder(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(status_error(status.as_u16(), retry_after, message));
        }

        Ok(response.json().await?)
    }
}

/// Parse `retry-after` in whole seconds
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_error(status: u16, retry_after: Option<Duration>, message: String) -> LlmError {
    if status == 429 {
        return LlmError::RateLimited {
            retry_after: retry_after.unwrap_or(Duration::from_secs(DEFAULT_RETRY_AFTER_SECS)),
        };
    }
    LlmError::ApiError { status, message }
}

fn event_source_error(err: reqwest_eventsource::Error) -> LlmError {
    use reqwest_eventsource::Error as EsError;
    match err {
        EsError::InvalidStatusCode(status, response) => status_error(
            status.as_u16(),
            retry_after(response.headers()),
            status.canonical_reason().unwrap_or("unknown status").to_string(),
        ),
        EsError::Transport(e) => e.into(),
        other => LlmError::EventSource(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_request(&request, false);
        let response = self.send_request(body).await?;
        Self::parse_response(response)
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.build_request(&request, true);
        let mut source: EventSource = self
            .request_builder(&body)
            .eventsource()
            .map_err(|e| LlmError::EventSource(e.to_string()))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        let mut parser = StreamParser::new();
        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    let parsed = match parse_sse_event(&message.data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            tracing::warn!(event = %message.event, error = %e, "Skipping unparseable stream event");
                            continue;
                        }
                    };
                    let Some(parsed) = parsed else { continue };
                    let delta = match parser.process_event(parsed) {
                        Ok(delta) => delta,
                        Err(e) => {
                            source.close();
                            return Err(e);
                        }
                    };
                    if let Some(delta) = delta {
                        // Receiver gone means the consumer stopped reading; keep draining.
                        let _ = chunk_tx.send(StreamChunk::TextDelta(delta)).await;
                    }
                    if parser.is_finished() {
                        source.close();
                        break;
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    source.close();
                    return Err(event_source_error(e));
                }
            }
        }

        let response = parser.finish()?;
        let _ = chunk_tx
            .send(StreamChunk::MessageDone {
                stop_reason: response.stop_reason,
                usage: response.usage,
            })
            .await;
        Ok(response)
    }
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("model", &self.config.model)
            .field("max_tokens", &self.config.max_tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn client() -> AnthropicClient {
        AnthropicClient::with_api_key("test-key", AnthropicConfig::default()).unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = AnthropicConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.base_url, ANTHROPIC_API_URL);
    }

    #[test]
    fn test_blank_api_key_is_missing() {
        let err = AnthropicClient::with_api_key("  ", AnthropicConfig::default()).unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey { .. }));
    }

    #[test]
    fn test_unset_env_var_is_missing() {
        let err = api_key_from_env("DRAFTWRIGHT_TEST_KEY_THAT_IS_NEVER_SET").unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey { env_var } if env_var == "DRAFTWRIGHT_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_build_request_conversation() {
        let request = CompletionRequest::new("You write PRDs")
            .with_user_message("Draft it")
            .with_message(Message::assistant("# Draft"))
            .with_user_message("Add Goals")
            .with_temperature(0.2);

        let body = client().build_request(&request, true);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["system"], "You write PRDs");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][2]["content"], "Add Goals");
    }

    #[test]
    fn test_build_request_without_stream_flag() {
        let body = client().build_request(&CompletionRequest::default().with_max_tokens(10), false);
        assert!(body.get("stream").is_none());
        assert!(body.get("system").is_none());
        assert_eq!(body["max_tokens"], 10);
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let body = json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "id": "x", "name": "n", "input": {}},
                {"type": "text", "text": "second"}
            ],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        });
        let response = AnthropicClient::parse_response(body).unwrap();
        assert_eq!(response.content, "first\nsecond");
        assert_eq!(response.stop_reason, StopReason::MaxTokens);
        assert_eq!(response.usage, Usage::new(10, 20));
    }

    #[test]
    fn test_parse_response_without_content_is_invalid() {
        let err = AnthropicClient::parse_response(json!({"stop_reason": "end_turn"})).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(429, Some(Duration::from_secs(3)), String::new()),
            LlmError::RateLimited { retry_after } if retry_after == Duration::from_secs(3)
        ));
        assert!(matches!(
            status_error(429, None, String::new()),
            LlmError::RateLimited { retry_after } if retry_after == Duration::from_secs(DEFAULT_RETRY_AFTER_SECS)
        ));
        assert!(matches!(status_error(529, None, "Overloaded".to_string()), LlmError::ApiError { status: 529, .. }));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
