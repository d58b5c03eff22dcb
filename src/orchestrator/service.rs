//! Request entry point: preflight checks, then one orchestrator run.
//!
//! Preflight failures and panics both end in a single `error` frame, so a
//! client always sees a terminal frame unless it went away first.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::Instrument;

use super::runner::{Orchestrator, Pipeline, RunRequest, RunSummary};
use crate::error::DraftwrightError;
use crate::id::generate_request_id;
use crate::protocol::{ErrorCode, ErrorDetails, FrameSink, Phase, StreamFrame};
use crate::rules::{DEFAULT_MAX_ATTEMPTS, PackError, RulePack};

/// Default cap on `specText`, in characters.
pub const DEFAULT_MAX_SPEC_CHARS: usize = 100_000;

/// Default frames buffered between the run and the transport.
pub const DEFAULT_FRAME_BUFFER: usize = 64;

/// Body of a generate request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub spec_text: String,
    #[serde(default)]
    pub max_attempts: Option<f64>,
}

impl GenerateRequest {
    pub fn from_slice(body: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Reject a blank spec or one longer than `max_chars` characters.
    pub fn check(&self, max_chars: usize) -> crate::Result<()> {
        if self.spec_text.trim().is_empty() {
            return Err(DraftwrightError::InvalidInput("specText must not be empty".to_string()));
        }
        let chars = self.spec_text.chars().count();
        if chars > max_chars {
            return Err(DraftwrightError::InvalidInput(format!(
                "specText is {} characters; the limit is {}",
                chars, max_chars
            )));
        }
        Ok(())
    }

    /// Requested attempts as a whole number; fractions round down.
    pub fn requested_attempts(&self) -> Option<i64> {
        self.max_attempts.filter(|n| n.is_finite()).map(|n| n.floor() as i64)
    }
}

/// Why a request never reached the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rejection {
    code: ErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<DraftwrightError> for Rejection {
    fn from(e: DraftwrightError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Shared by every connection; holds the outcome of startup configuration.
pub struct GenerationService {
    pack: Result<Arc<RulePack>, String>,
    /// `Err` names the credential variable that was not set
    pipeline: Result<Pipeline, String>,
    max_spec_chars: usize,
    frame_buffer: usize,
}

impl GenerationService {
    /// A broken pack or missing credential does not stop the process; each
    /// request is answered with the matching error frame instead.
    pub fn new(pack: Result<RulePack, PackError>, pipeline: Result<Pipeline, String>) -> Self {
        if let Err(e) = &pack {
            tracing::error!(error = %e, "Rule pack failed to load; requests will be rejected");
        }
        if let Err(env_var) = &pipeline {
            tracing::error!(env_var = %env_var, "Provider credential missing; requests will be rejected");
        }
        Self {
            pack: pack.map(Arc::new).map_err(|e| e.to_string()),
            pipeline,
            max_spec_chars: DEFAULT_MAX_SPEC_CHARS,
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }

    pub fn with_max_spec_chars(mut self, max_spec_chars: usize) -> Self {
        self.max_spec_chars = max_spec_chars;
        self
    }

    pub fn with_frame_buffer(mut self, frame_buffer: usize) -> Self {
        self.frame_buffer = frame_buffer.max(1);
        self
    }

    pub fn pack(&self) -> Option<&RulePack> {
        self.pack.as_deref().ok()
    }

    /// Payload of `GET /health`.
    pub fn health(&self) -> Value {
        match &self.pack {
            Ok(pack) => json!({
                "status": "ok",
                "pack": {
                    "id": pack.id(),
                    "version": pack.version(),
                    "fingerprint": pack.fingerprint(),
                },
            }),
            Err(e) => json!({
                "status": "degraded",
                "pack": null,
                "packError": e,
            }),
        }
    }

    fn preflight(&self, body: &[u8]) -> Result<(Orchestrator, GenerateRequest), Rejection> {
        let pipeline = self.pipeline.as_ref().map_err(|env_var| {
            Rejection::new(
                ErrorCode::MissingApiKey,
                format!("Missing API key: set the {} environment variable", env_var),
            )
        })?;
        let pack = self
            .pack
            .as_ref()
            .map_err(|e| Rejection::new(ErrorCode::ValidationFailed, format!("Rule pack invalid: {}", e)))?;

        let request = GenerateRequest::from_slice(body)?;
        request.check(self.max_spec_chars)?;

        Ok((Orchestrator::new(Arc::clone(pack), pipeline.clone()), request))
    }

    fn default_attempts(&self) -> u32 {
        self.pack()
            .map(|p| p.effective_max_attempts(None))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Answer one request on `sink`. Returns the run summary when the
    /// request got past preflight and the run did not panic.
    pub async fn handle(&self, body: &[u8], sink: &mut FrameSink) -> Option<RunSummary> {
        let request_id = generate_request_id();
        let span = tracing::info_span!("generate", request_id = %request_id);

        let guarded = AssertUnwindSafe(self.process(body, &request_id, sink).instrument(span)).catch_unwind();
        let summary = match guarded.await {
            Ok(summary) => summary,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(request_id = %request_id, reason = %reason, "Run panicked");
                let details = ErrorDetails::new(
                    ErrorCode::UnexpectedError,
                    format!("Internal error: {}", reason),
                    Phase::Error,
                    0,
                    self.default_attempts(),
                )
                .with_context(json!({ "requestId": request_id }));
                sink.send(StreamFrame::error(details)).await;
                None
            }
        };
        sink.close();
        summary
    }

    async fn process(&self, body: &[u8], request_id: &str, sink: &mut FrameSink) -> Option<RunSummary> {
        let (orchestrator, request) = match self.preflight(body) {
            Ok(accepted) => accepted,
            Err(rejection) => {
                tracing::warn!(code = rejection.code.as_str(), reason = %rejection.message, "Request rejected");
                let details = ErrorDetails::new(
                    rejection.code,
                    rejection.message,
                    Phase::Error,
                    0,
                    self.default_attempts(),
                )
                .with_context(json!({ "requestId": request_id }));
                sink.send(StreamFrame::error(details)).await;
                return None;
            }
        };

        let max_attempts = orchestrator.pack().effective_max_attempts(request.requested_attempts());
        tracing::info!(
            spec_chars = request.spec_text.chars().count(),
            max_attempts,
            pack = orchestrator.pack().id(),
            "Request accepted"
        );
        let run = RunRequest {
            request_id: request_id.to_string(),
            spec_text: request.spec_text,
            max_attempts,
        };
        Some(orchestrator.run(run, sink).await)
    }

    /// Run a request on its own task; the receiver yields its frames and
    /// ends when the stream closes.
    pub fn spawn(self: &Arc<Self>, body: Vec<u8>) -> mpsc::Receiver<StreamFrame> {
        let (mut sink, rx) = FrameSink::channel(self.frame_buffer);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.handle(&body, &mut sink).await;
        });
        rx
    }
}

impl std::fmt::Debug for GenerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationService")
            .field("pack", &self.pack.as_ref().map(|p| p.id()))
            .field("credential", &self.pipeline.is_ok())
            .field("max_spec_chars", &self.max_spec_chars)
            .finish()
    }
}
