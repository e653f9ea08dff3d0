//! Per-agent circuit breaker.
//!
//! Closed lets everything through, Open blocks everything until the reset
//! timeout has passed since the last failure, HalfOpen admits a limited
//! number of trial deliveries. The Open → HalfOpen transition only happens
//! as a side effect of [`CircuitBreaker::allow_request`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit blocks before admitting trial calls.
    pub reset_timeout: Duration,
    /// Trial calls admitted in half-open, and successes needed to close.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// Point-in-time view of a breaker, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_success_count: u32,
    pub half_open_calls: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    agent_id: String,
    settings: CircuitBreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    half_open_success_count: u32,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, mut settings: CircuitBreakerSettings) -> Self {
        settings.failure_threshold = settings.failure_threshold.max(1);
        settings.half_open_max_calls = settings.half_open_max_calls.max(1);
        Self {
            agent_id: agent_id.into(),
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            half_open_success_count: 0,
            half_open_calls: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            half_open_success_count: self.half_open_success_count,
            half_open_calls: self.half_open_calls,
        }
    }

    /// Gate one delivery. May move Open → HalfOpen.
    pub fn allow_request(&mut self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if elapsed > self.settings.reset_timeout {
                    tracing::info!(
                        agent_id = %self.agent_id,
                        "Circuit breaker half-open - admitting trial deliveries"
                    );
                    self.state = CircuitState::HalfOpen;
                    self.half_open_success_count = 0;
                    // This request is the first trial.
                    self.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.settings.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_success_count += 1;
                if self.half_open_success_count >= self.settings.half_open_max_calls {
                    tracing::info!(
                        agent_id = %self.agent_id,
                        previous_failures = self.consecutive_failures,
                        "Agent recovered - closing circuit breaker"
                    );
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.half_open_success_count = 0;
                    self.half_open_calls = 0;
                }
            }
            // A late success cannot close an open circuit; only trials can.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.settings.failure_threshold {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        failure_count = self.consecutive_failures,
                        threshold = self.settings.failure_threshold,
                        reset_timeout_ms = self.settings.reset_timeout.as_millis() as u64,
                        "Agent failure threshold exceeded - opening circuit breaker"
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    trial_successes = self.half_open_success_count,
                    "Trial delivery failed - reopening circuit breaker"
                );
                self.state = CircuitState::Open;
                self.half_open_success_count = 0;
                self.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }
}
