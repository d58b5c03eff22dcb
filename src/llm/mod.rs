//! LLM Client Layer - Anthropic API integration with streaming and resiliency
//!
//! This module provides:
//! - Message types for LLM communication
//! - LlmClient trait for API abstraction, plus a scripted mock
//! - AnthropicClient implementation (JSON and SSE streaming)
//! - Circuit breaker and the resilient drafting client

pub mod anthropic;
pub mod breaker;
pub mod client;
pub mod resilient;
pub mod streaming;
pub mod types;

pub use anthropic::{API_KEY_ENV, AnthropicClient, AnthropicConfig, api_key_from_env};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::{LlmClient, LlmError, MockLlmClient, MockReply};
pub use resilient::{DraftStream, ResilientClient, RetryPolicy};
pub use streaming::{StreamChunk, StreamEvent, StreamParser, parse_sse_event};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, Usage};
