//! Circuit breaker guarding the generation provider.
//!
//! `closed` lets calls through and counts consecutive failures. Reaching the
//! threshold trips it `open`: calls fail fast until the cooldown elapses. The
//! first call after that runs alone as a `half-open` trial; its success closes
//! the breaker, its failure reopens it for another cooldown.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "halfOpen",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial call
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_started: Instant },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                cooldown: config.cooldown,
            },
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to make a call. `Err` carries how long until calls may resume.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        let now = Instant::now();
        match *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { until } if now < until => Err(until - now),
            Inner::Open { .. } => {
                tracing::info!("Circuit breaker half-open, allowing trial call");
                *inner = Inner::HalfOpen { trial_started: now };
                Ok(())
            }
            // A trial that never reported back (dropped future) must not wedge the breaker.
            Inner::HalfOpen { trial_started } if now.duration_since(trial_started) >= self.config.cooldown => {
                *inner = Inner::HalfOpen { trial_started: now };
                Ok(())
            }
            Inner::HalfOpen { trial_started } => {
                Err(self.config.cooldown.saturating_sub(now.duration_since(trial_started)))
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if !matches!(*inner, Inner::Closed { failures: 0 }) {
            tracing::debug!("Circuit breaker closed");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    /// Count a failure; returns the state afterwards.
    pub fn record_failure(&self) -> BreakerState {
        let mut inner = self.lock();
        let now = Instant::now();
        let next = match *inner {
            Inner::Closed { failures } if failures + 1 >= self.config.failure_threshold => {
                tracing::warn!(
                    failures = failures + 1,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit breaker opened"
                );
                Inner::Open {
                    until: now + self.config.cooldown,
                }
            }
            Inner::Closed { failures } => Inner::Closed { failures: failures + 1 },
            Inner::HalfOpen { .. } => {
                tracing::warn!("Trial call failed, circuit breaker reopened");
                Inner::Open {
                    until: now + self.config.cooldown,
                }
            }
            Inner::Open { until } => Inner::Open { until },
        };
        *inner = next;
        state_of(&inner)
    }

    pub fn state(&self) -> BreakerState {
        state_of(&self.lock())
    }

    pub fn consecutive_failures(&self) -> u32 {
        match *self.lock() {
            Inner::Closed { failures } => failures,
            _ => self.config.failure_threshold,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn state_of(inner: &Inner) -> BreakerState {
    match inner {
        Inner::Closed { .. } => BreakerState::Closed,
        Inner::Open { .. } => BreakerState::Open,
        Inner::HalfOpen { .. } => BreakerState::HalfOpen,
    }
}
