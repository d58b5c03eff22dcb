//! Resilient drafting client: retries, fallback model and circuit breaking
//! around a streaming [`LlmClient`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::breaker::{BreakerState, CircuitBreaker};
use super::client::{LlmClient, LlmError};
use super::streaming::StreamChunk;
use super::types::{CompletionRequest, CompletionResponse};

/// Retry behaviour for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts against the primary client
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time
    pub base_delay: Duration,
    /// No single wait is longer than this
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based), or `None` when the
    /// provider asked for longer than `max_delay`.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Option<Duration> {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
            .min(self.max_delay);
        match retry_after {
            Some(asked) if asked > self.max_delay => None,
            Some(asked) => Some(exp.max(asked)),
            None => Some(exp),
        }
    }
}

/// A draft being generated: a finite, non-restartable sequence of text
/// deltas plus the final response.
#[derive(Debug)]
pub struct DraftStream {
    deltas: mpsc::Receiver<String>,
    result: oneshot::Receiver<Result<CompletionResponse, LlmError>>,
}

impl DraftStream {
    /// Next text delta; `None` once generation has finished either way.
    pub async fn next_delta(&mut self) -> Option<String> {
        self.deltas.recv().await
    }

    /// Await the final response. Unread deltas are discarded.
    pub async fn text(self) -> Result<CompletionResponse, LlmError> {
        let DraftStream { deltas, result } = self;
        drop(deltas);
        result
            .await
            .unwrap_or_else(|_| Err(LlmError::InvalidResponse("drafting task ended without a result".to_string())))
    }
}

/// Wraps a primary client, an optional fallback client and a shared breaker.
#[derive(Clone)]
pub struct ResilientClient {
    primary: Arc<dyn LlmClient>,
    fallback: Option<Arc<dyn LlmClient>>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    channel_capacity: usize,
}

impl ResilientClient {
    pub fn new(primary: Arc<dyn LlmClient>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            primary,
            fallback: None,
            breaker,
            policy: RetryPolicy::default(),
            channel_capacity: 64,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn LlmClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Capacity of the bounded delta channel
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn model(&self) -> &str {
        self.primary.model()
    }

    /// Start generating. Deltas are forwarded as they arrive; the final
    /// response, or the error that ended generation, arrives via [`DraftStream::text`].
    pub fn generate_with_fallback(&self, request: CompletionRequest) -> DraftStream {
        let (delta_tx, deltas) = mpsc::channel(self.channel_capacity);
        let (result_tx, result) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.drive(request, delta_tx).await;
            let _ = result_tx.send(outcome);
        });
        DraftStream { deltas, result }
    }

    async fn drive(
        &self,
        request: CompletionRequest,
        delta_tx: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        let mut clients: Vec<(&Arc<dyn LlmClient>, u32)> = vec![(&self.primary, self.policy.max_retries + 1)];
        if let Some(fallback) = &self.fallback {
            clients.push((fallback, 1));
        }

        let mut emitted = false;
        let mut last_error = None;

        for (index, (client, attempts)) in clients.into_iter().enumerate() {
            if index > 0 {
                tracing::warn!(model = client.model(), "Primary model exhausted, switching to fallback");
            }
            for attempt in 1..=attempts {
                if let Err(retry_in) = self.breaker.try_acquire() {
                    tracing::warn!(retry_in_ms = retry_in.as_millis() as u64, "Circuit open, failing fast");
                    return Err(LlmError::CircuitOpen { retry_in });
                }

                match stream_once(client.as_ref(), request.clone(), self.channel_capacity, &delta_tx, &mut emitted)
                    .await
                {
                    Ok(response) => {
                        self.breaker.record_success();
                        return Ok(response);
                    }
                    Err(e) => {
                        if e.is_retryable() {
                            if self.breaker.record_failure() == BreakerState::Open {
                                return Err(e);
                            }
                        } else {
                            // The provider answered, so it is reachable.
                            self.breaker.record_success();
                        }

                        if emitted || !e.is_retryable() {
                            return Err(e);
                        }

                        tracing::warn!(
                            model = client.model(),
                            attempt,
                            error = %e,
                            "Generation attempt failed"
                        );

                        let wait = if attempt < attempts {
                            self.policy.delay_for(attempt, e.retry_after())
                        } else {
                            None
                        };
                        last_error = Some(e);
                        match wait {
                            Some(delay) => tokio::time::sleep(delay).await,
                            None => break,
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("no generation attempt was made".to_string())))
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("primary", &self.primary.model())
            .field("fallback", &self.fallback.as_ref().map(|c| c.model().to_string()))
            .field("policy", &self.policy)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

/// One streaming call, forwarding text deltas as they arrive.
async fn stream_once(
    client: &dyn LlmClient,
    request: CompletionRequest,
    capacity: usize,
    delta_tx: &mpsc::Sender<String>,
    emitted: &mut bool,
) -> Result<CompletionResponse, LlmError> {
    let (chunk_tx, mut chunk_rx) = mpsc::channel(capacity);
    let call = client.stream(request, chunk_tx);
    let forward = async {
        while let Some(chunk) = chunk_rx.recv().await {
            if let StreamChunk::TextDelta(delta) = chunk
                && !delta.is_empty()
            {
                *emitted = true;
                // Reader gone: keep draining so the upstream call can finish.
                let _ = delta_tx.send(delta).await;
            }
        }
    };
    let (result, ()) = tokio::join!(call, forward);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::breaker::BreakerConfig;
    use crate::llm::client::{MockLlmClient, MockReply};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
        }))
    }

    fn overloaded() -> LlmError {
        LlmError::ApiError {
            status: 529,
            message: "Overloaded".to_string(),
        }
    }

    async fn collect(mut stream: DraftStream) -> (String, Result<CompletionResponse, LlmError>) {
        let mut text = String::new();
        while let Some(delta) = stream.next_delta().await {
            text.push_str(&delta);
        }
        (text, stream.text().await)
    }

    #[test]
    fn test_delay_for_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1, None), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2, None), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3, None), Some(Duration::from_millis(350)));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(300))),
            Some(Duration::from_millis(300))
        );
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(5))), None);
    }

    #[tokio::test]
    async fn test_streams_deltas_and_final_text() {
        let primary = Arc::new(MockLlmClient::with_responses(["# Overview of the product"]));
        let client = ResilientClient::new(primary, breaker(3)).with_retry_policy(fast_policy(0));

        let (text, result) = collect(client.generate_with_fallback(CompletionRequest::new("sys"))).await;
        assert_eq!(text, "# Overview of the product");
        assert_eq!(result.unwrap().content, "# Overview of the product");
    }

    #[tokio::test]
    async fn test_retries_transient_failure_before_output() {
        let primary = Arc::new(MockLlmClient::with_responses(Vec::<String>::new()));
        primary.push(MockReply::Error(overloaded()));
        primary.push(MockReply::Text("recovered".to_string()));
        let client = ResilientClient::new(primary.clone(), breaker(5)).with_retry_policy(fast_policy(2));

        let (text, result) = collect(client.generate_with_fallback(CompletionRequest::default())).await;
        assert_eq!(text, "recovered");
        assert!(result.is_ok());
        assert_eq!(primary.call_count(), 2);
        assert_eq!(client.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_falls_back_after_primary_exhausted() {
        let primary = Arc::new(MockLlmClient::new().then_error(overloaded()).then_error(overloaded()));
        let fallback = Arc::new(MockLlmClient::with_responses(["from fallback"]).with_model("fallback-model"));
        let client = ResilientClient::new(primary.clone(), breaker(10))
            .with_fallback(fallback.clone())
            .with_retry_policy(fast_policy(1));

        let (text, result) = collect(client.generate_with_fallback(CompletionRequest::default())).await;
        assert_eq!(text, "from fallback");
        assert_eq!(result.unwrap().content, "from fallback");
        assert_eq!(primary.call_count(), 2);
        assert_eq!(fallback.call_count(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let primary = Arc::new(MockLlmClient::new().then_error(LlmError::ApiError {
            status: 400,
            message: "bad request".to_string(),
        }));
        let fallback = Arc::new(MockLlmClient::repeating("unused"));
        let client = ResilientClient::new(primary.clone(), breaker(1))
            .with_fallback(fallback.clone())
            .with_retry_policy(fast_policy(3));

        let (_, result) = collect(client.generate_with_fallback(CompletionRequest::default())).await;
        assert!(matches!(result, Err(LlmError::ApiError { status: 400, .. })));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 0);
        assert_eq!(client.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failure_after_output_is_not_retried() {
        let primary = Arc::new(MockLlmClient::repeating("never reached"));
        primary.push(MockReply::FailMidStream {
            partial: "half a draft".to_string(),
            error: LlmError::Network("connection reset".to_string()),
        });
        let client = ResilientClient::new(primary.clone(), breaker(5)).with_retry_policy(fast_policy(3));

        let (text, result) = collect(client.generate_with_fallback(CompletionRequest::default())).await;
        assert_eq!(text, "half a draft");
        assert!(matches!(result, Err(LlmError::Network(_))));
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_calling() {
        let shared = breaker(2);
        let primary = Arc::new(MockLlmClient::new().then_error(overloaded()).then_error(overloaded()));
        let client = ResilientClient::new(primary.clone(), shared.clone()).with_retry_policy(fast_policy(5));

        let (_, result) = collect(client.generate_with_fallback(CompletionRequest::default())).await;
        assert!(result.is_err());
        assert_eq!(shared.state(), BreakerState::Open);
        assert_eq!(primary.call_count(), 2);

        let (_, result) = collect(client.generate_with_fallback(CompletionRequest::default())).await;
        assert!(matches!(result, Err(LlmError::CircuitOpen { .. })));
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dropping_reader_does_not_abort_generation() {
        let primary = Arc::new(MockLlmClient::with_responses(["a b c d e f g h"]));
        let client = ResilientClient::new(primary, breaker(3)).with_channel_capacity(1);

        let mut stream = client.generate_with_fallback(CompletionRequest::default());
        let first = stream.next_delta().await;
        assert_eq!(first.as_deref(), Some("a "));
        let response = stream.text().await.unwrap();
        assert_eq!(response.content, "a b c d e f g h");
    }
}
