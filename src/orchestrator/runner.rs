//! The generate -> validate -> self-review -> heal loop for one request.
//!
//! Every run owns its conversation, attempt counter and draft. The rule pack
//! and the collaborators in [`Pipeline`] are shared read-only between runs;
//! the drafter's circuit breaker is the only shared mutable state.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use super::context::{KnowledgeSource, NoKnowledge, NoResearch, ResearchProvider};
use crate::error::{DraftwrightError, Result};
use crate::llm::{CompletionRequest, Message, ResilientClient, Usage};
use crate::prompt::PromptRenderer;
use crate::protocol::{
    ErrorCode, ErrorDetails, FrameSink, GenerationFrame, HealingFrame, Phase, ResultFrame, SelfReviewFrame,
    SendOutcome, StreamFrame, ValidationFrame,
};
use crate::rules::RulePack;
use crate::validation::{SelfReviewer, aggregate, validate};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A draft passed validation, or review filtered every issue
    Succeeded,
    /// Attempt budget spent without a clean draft
    Exhausted,
    /// The pipeline broke; an `error` frame was sent
    Errored(ErrorCode),
    /// The client went away before a terminal frame
    Disconnected,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::Errored(_) => "errored",
            RunOutcome::Disconnected => "disconnected",
        }
    }
}

/// Summary returned to the caller of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub attempts: u32,
    pub draft: String,
    pub usage: Usage,
}

/// Input of one run, already validated by preflight.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub request_id: String,
    pub spec_text: String,
    pub max_attempts: u32,
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct Pipeline {
    pub drafter: ResilientClient,
    pub reviewer: Arc<SelfReviewer>,
    pub renderer: Arc<PromptRenderer>,
    pub knowledge: Arc<dyn KnowledgeSource>,
    pub research: Arc<dyn ResearchProvider>,
    /// Output token cap for drafting calls
    pub draft_max_tokens: Option<u32>,
}

impl Pipeline {
    pub fn new(drafter: ResilientClient, reviewer: SelfReviewer) -> Self {
        Self {
            drafter,
            reviewer: Arc::new(reviewer),
            renderer: Arc::new(PromptRenderer::new()),
            knowledge: Arc::new(NoKnowledge),
            research: Arc::new(NoResearch),
            draft_max_tokens: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn with_research(mut self, research: Arc<dyn ResearchProvider>) -> Self {
        self.research = research;
        self
    }

    pub fn with_draft_max_tokens(mut self, max_tokens: u32) -> Self {
        self.draft_max_tokens = Some(max_tokens);
        self
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("drafter", &self.drafter)
            .field("reviewer", &self.reviewer)
            .field("draft_max_tokens", &self.draft_max_tokens)
            .finish()
    }
}

/// Drives runs against one rule pack.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pack: Arc<RulePack>,
    pipeline: Pipeline,
}

impl Orchestrator {
    pub fn new(pack: Arc<RulePack>, pipeline: Pipeline) -> Self {
        Self { pack, pipeline }
    }

    pub fn pack(&self) -> &RulePack {
        &self.pack
    }

    /// Run the loop, writing frames to `sink`. Exactly one terminal frame is
    /// written unless the client disconnects first.
    pub async fn run(&self, request: RunRequest, sink: &mut FrameSink) -> RunSummary {
        let mut run = Run {
            orchestrator: self,
            request_id: request.request_id,
            sink,
            max_attempts: request.max_attempts.max(1),
            attempt: 0,
            phase: Phase::LoadingKnowledge,
            messages: Vec::new(),
            draft: String::new(),
            usage: Usage::default(),
            started: Instant::now(),
        };

        let outcome = match run.execute(&request.spec_text).await {
            Ok(outcome) => outcome,
            Err(e) => run.fail(e).await,
        };

        tracing::info!(
            request_id = %run.request_id,
            outcome = outcome.as_str(),
            attempts = run.attempt,
            duration_ms = run.started.elapsed().as_millis() as u64,
            input_tokens = run.usage.input_tokens,
            output_tokens = run.usage.output_tokens,
            "Run finished"
        );

        RunSummary {
            outcome,
            attempts: run.attempt,
            draft: run.draft,
            usage: run.usage,
        }
    }
}

/// Request-local state of one run.
struct Run<'a> {
    orchestrator: &'a Orchestrator,
    request_id: String,
    sink: &'a mut FrameSink,
    max_attempts: u32,
    attempt: u32,
    phase: Phase,
    messages: Vec<Message>,
    draft: String,
    usage: Usage,
    started: Instant,
}

/// Text of the draft being streamed, with its length in chars.
#[derive(Debug, Default)]
struct DraftAccumulator {
    text: String,
    chars: usize,
}

impl DraftAccumulator {
    fn push(mut self, delta: &str) -> Self {
        self.text.push_str(delta);
        self.chars += delta.chars().count();
        self
    }
}

impl Run<'_> {
    fn pipeline(&self) -> &Pipeline {
        &self.orchestrator.pipeline
    }

    fn pack(&self) -> &RulePack {
        &self.orchestrator.pack
    }

    fn elapsed_ms(since: Instant) -> u64 {
        since.elapsed().as_millis() as u64
    }

    /// Write a frame; false once the client is gone.
    async fn emit(&mut self, frame: StreamFrame) -> bool {
        self.sink.send(frame).await != SendOutcome::Disconnected
    }

    async fn enter(&mut self, phase: Phase) -> bool {
        self.phase = phase;
        tracing::debug!(request_id = %self.request_id, phase = %phase, attempt = self.attempt, "Entering phase");
        self.emit(StreamFrame::phase(phase, self.attempt, self.max_attempts)).await
    }

    fn disconnected(&self) -> bool {
        if self.sink.is_disconnected() {
            tracing::info!(request_id = %self.request_id, phase = %self.phase, "Client disconnected, stopping run");
            return true;
        }
        false
    }

    async fn execute(&mut self, spec_text: &str) -> Result<RunOutcome> {
        if !self.enter(Phase::LoadingKnowledge).await {
            return Ok(RunOutcome::Disconnected);
        }
        let knowledge = match self.pipeline().knowledge.load(spec_text).await {
            Ok(knowledge) => knowledge,
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Knowledge unavailable, continuing without it");
                None
            }
        };

        if !self.enter(Phase::PerformingResearch).await {
            return Ok(RunOutcome::Disconnected);
        }
        let research = match self.pipeline().research.research(spec_text).await {
            Ok(research) => research,
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Research unavailable, continuing without it");
                None
            }
        };

        let system = self
            .pipeline()
            .renderer
            .draft_system(self.pack(), knowledge.as_deref(), research.as_deref())?;
        let first_turn = self.pipeline().renderer.draft_user(spec_text)?;
        self.messages.push(Message::user(first_turn));

        for attempt in 1..=self.max_attempts {
            self.attempt = attempt;

            if self.disconnected() || !self.enter(Phase::Generating).await {
                return Ok(RunOutcome::Disconnected);
            }
            let mut request = CompletionRequest::new(system.as_str()).with_messages(self.messages.clone());
            if let Some(max_tokens) = self.pipeline().draft_max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            let Some(draft) = self.generate(request).await? else {
                return Ok(RunOutcome::Disconnected);
            };
            self.draft = draft;

            if self.disconnected() || !self.enter(Phase::Validating).await {
                return Ok(RunOutcome::Disconnected);
            }
            let started = Instant::now();
            let report = validate(&self.draft, self.pack());
            let actionable = report.actionable_issues();
            let passed = report.ok;
            let frame = ValidationFrame {
                attempt,
                report,
                duration_ms: Self::elapsed_ms(started),
            };
            if !self.emit(StreamFrame::Validation(frame)).await {
                return Ok(RunOutcome::Disconnected);
            }
            if passed {
                return Ok(self.finish(true, None).await);
            }

            if self.disconnected() || !self.enter(Phase::SelfReviewing).await {
                return Ok(RunOutcome::Disconnected);
            }
            let review = self.pipeline().reviewer.review(&self.draft, actionable).await;
            let frame = SelfReviewFrame {
                attempt,
                confirmed: review.confirmed.iter().map(|i| i.rule_id.clone()).collect(),
                filtered: review.filtered.iter().map(|i| i.rule_id.clone()).collect(),
                failed_open: review.failed_open,
                duration_ms: review.duration.as_millis() as u64,
            };
            if !self.emit(StreamFrame::SelfReview(frame)).await {
                return Ok(RunOutcome::Disconnected);
            }
            if review.confirmed.is_empty() {
                tracing::info!(
                    request_id = %self.request_id,
                    attempt,
                    filtered = review.filtered.len(),
                    "Self-review filtered every issue, accepting draft"
                );
                return Ok(self.finish(true, Some("accepted after self-review")).await);
            }

            if !self.enter(Phase::Healing).await {
                return Ok(RunOutcome::Disconnected);
            }
            let instruction = aggregate(&review.confirmed, self.pack());
            let frame = HealingFrame {
                attempt,
                instruction: instruction.clone(),
                issue_count: review.confirmed.len(),
            };
            if !self.emit(StreamFrame::Healing(frame)).await {
                return Ok(RunOutcome::Disconnected);
            }
            self.messages.push(Message::assistant(self.draft.clone()));
            self.messages.push(Message::user(instruction));

            if attempt == self.max_attempts {
                return Ok(self.finish(false, Some("attempt budget exhausted")).await);
            }
        }

        // The loop always returns on its last attempt.
        Err(DraftwrightError::Internal("attempt loop ended without a verdict".to_string()))
    }

    /// Stream one draft, forwarding each delta as a `generation` frame.
    /// `None` when the client disconnected mid-stream.
    async fn generate(&mut self, request: CompletionRequest) -> Result<Option<String>> {
        let mut stream = self.pipeline().drafter.generate_with_fallback(request);
        let mut draft = DraftAccumulator::default();

        while let Some(delta) = stream.next_delta().await {
            draft = draft.push(&delta);
            let frame = GenerationFrame {
                attempt: self.attempt,
                delta,
                accumulated_length: draft.chars,
            };
            if !self.emit(StreamFrame::Generation(frame)).await {
                // Upstream generation is left to finish on its own.
                return Ok(None);
            }
        }

        let response = stream.text().await?;
        self.usage.add(&response.usage);
        if response.stop_reason.is_truncated() {
            tracing::warn!(request_id = %self.request_id, attempt = self.attempt, "Draft hit the output token limit");
        }
        tracing::debug!(
            request_id = %self.request_id,
            attempt = self.attempt,
            chars = draft.chars,
            "Draft generated"
        );
        Ok(Some(draft.text))
    }

    async fn finish(&mut self, success: bool, note: Option<&str>) -> RunOutcome {
        let phase = if success { Phase::Done } else { Phase::Failed };
        self.phase = phase;
        let frame = match note {
            Some(note) => StreamFrame::phase_with_message(phase, self.attempt, self.max_attempts, note),
            None => StreamFrame::phase(phase, self.attempt, self.max_attempts),
        };
        if !self.emit(frame).await {
            return RunOutcome::Disconnected;
        }
        let frame = ResultFrame {
            success,
            draft: self.draft.clone(),
            attempts: self.attempt,
            total_duration_ms: Self::elapsed_ms(self.started),
            usage: self.usage,
        };
        if !self.emit(StreamFrame::Result(frame)).await {
            return RunOutcome::Disconnected;
        }
        if success {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Exhausted
        }
    }

    async fn fail(&mut self, error: DraftwrightError) -> RunOutcome {
        let code = error.code();
        tracing::error!(
            request_id = %self.request_id,
            phase = %self.phase,
            attempt = self.attempt,
            code = code.as_str(),
            error = %error,
            "Run failed"
        );
        let details = ErrorDetails::new(code, error.to_string(), self.phase, self.attempt, self.max_attempts)
            .with_context(json!({
                "requestId": self.request_id,
                "model": self.pipeline().drafter.model(),
            }))
            .with_trace(format!("{:?}", error));
        if !self.emit(StreamFrame::error(details)).await {
            return RunOutcome::Disconnected;
        }
        RunOutcome::Errored(code)
    }
}

