//! Streaming support for LLM responses.
//!
//! Anthropic streams a message as Server-Sent Events. Each `data:` payload is
//! one JSON event; [`StreamParser`] folds them into text deltas and the final
//! stop reason and usage.

use serde::Deserialize;

use super::client::LlmError;
use super::types::{CompletionResponse, StopReason, Usage};

/// Chunks emitted to consumers during streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Text being generated
    TextDelta(String),

    /// Message complete with final stats
    MessageDone { stop_reason: StopReason, usage: Usage },
}

/// Events received during streaming from the Anthropic API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: u32,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<ApiUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub usage: Option<ApiUsage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Usage block as the API spells it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ApiUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ApiErrorBody {
    /// Map an in-stream error event to an error
    pub fn into_error(self) -> LlmError {
        match self.kind.as_str() {
            "overloaded_error" => LlmError::ApiError {
                status: 529,
                message: self.message,
            },
            "rate_limit_error" => LlmError::ApiError {
                status: 429,
                message: self.message,
            },
            "api_error" => LlmError::ApiError {
                status: 500,
                message: self.message,
            },
            _ => LlmError::EventSource(format!("{}: {}", self.kind, self.message)),
        }
    }
}

/// Parse the `data:` payload of one SSE event.
pub fn parse_sse_event(data: &str) -> Result<Option<StreamEvent>, LlmError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(data)?))
}

/// State tracker for parsing streaming responses.
#[derive(Debug, Default)]
pub struct StreamParser {
    text: String,
    stop_reason: StopReason,
    usage: Usage,
    finished: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in; returns the text delta it carried, if any.
    pub fn process_event(&mut self, event: StreamEvent) -> Result<Option<String>, LlmError> {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens.unwrap_or(0);
                    self.usage.output_tokens = usage.output_tokens.unwrap_or(0);
                }
                Ok(None)
            }
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::TextDelta { text },
                ..
            } => {
                self.text.push_str(&text);
                Ok(Some(text))
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = StopReason::from_api(&reason);
                }
                if let Some(output) = usage.and_then(|u| u.output_tokens) {
                    self.usage.output_tokens = output;
                }
                Ok(None)
            }
            StreamEvent::MessageStop => {
                self.finished = true;
                Ok(None)
            }
            StreamEvent::Error { error } => Err(error.into_error()),
            _ => Ok(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The accumulated response; an unfinished stream is an error
    pub fn finish(self) -> Result<CompletionResponse, LlmError> {
        if !self.finished {
            return Err(LlmError::EventSource("stream ended before message_stop".to_string()));
        }
        Ok(CompletionResponse {
            content: self.text,
            stop_reason: self.stop_reason,
            usage: self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: &[&str] = &[
        r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude","usage":{"input_tokens":25,"output_tokens":1}}}"#,
        r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        r#"{"type":"ping"}"#,
        r##"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"# Over"}}"##,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"view"}}"#,
        r#"{"type":"content_block_stop","index":0}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":15}}"#,
        r#"{"type":"message_stop"}"#,
    ];

    #[test]
    fn test_parser_folds_full_message() {
        let mut parser = StreamParser::new();
        let mut deltas = Vec::new();
        for raw in EVENTS {
            let event = parse_sse_event(raw).unwrap().unwrap();
            if let Some(delta) = parser.process_event(event).unwrap() {
                deltas.push(delta);
            }
        }
        assert_eq!(deltas, vec!["# Over", "view"]);
        assert!(parser.is_finished());

        let response = parser.finish().unwrap();
        assert_eq!(response.content, "# Overview");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.usage, Usage::new(25, 15));
    }

    #[test]
    fn test_unfinished_stream_is_error() {
        let mut parser = StreamParser::new();
        let event = parse_sse_event(EVENTS[3]).unwrap().unwrap();
        parser.process_event(event).unwrap();
        assert!(matches!(parser.finish(), Err(LlmError::EventSource(_))));
    }

    #[test]
    fn test_error_event_maps_overloaded() {
        let raw = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let event = parse_sse_event(raw).unwrap().unwrap();
        let err = StreamParser::new().process_event(event).unwrap_err();
        assert!(matches!(err, LlmError::ApiError { status: 529, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_non_text_delta_is_ignored() {
        let raw = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#;
        let event = parse_sse_event(raw).unwrap().unwrap();
        assert_eq!(StreamParser::new().process_event(event).unwrap(), None);
    }

    #[test]
    fn test_blank_and_done_payloads_skip() {
        assert!(parse_sse_event("").unwrap().is_none());
        assert!(parse_sse_event("[DONE]").unwrap().is_none());
        assert!(parse_sse_event("{not json").is_err());
    }
}
