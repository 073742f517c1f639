//! Circuit breaker guarding unreliable calls made during test execution.
//!
//! One breaker per guarded resource, shared across all concurrent workers.
//! The failure counter, state transitions and the half-open single-trial
//! rule live behind one mutex so they are atomic with respect to
//! concurrent callers.

use crate::error::{ErrorCategory, OrchestratorError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Public-facing circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Snapshot of one breaker for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub resource: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_opened: Option<f64>,
}

pub struct CircuitBreaker {
    resource: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: parking_lot::Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            resource: resource.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: parking_lot::Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Gate a call about to be made.
    ///
    /// Closed: pass. Open before the cooldown: fail fast without invoking
    /// the wrapped operation. Open after the cooldown: transition to
    /// half-open and admit exactly one trial call; concurrent callers keep
    /// failing fast until that trial resolves.
    pub fn preflight(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    info!(
                        resource = %self.resource,
                        "circuit cooldown elapsed, admitting half-open trial"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(self.open_error(self.cooldown.saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call: close the circuit and zero the counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(resource = %self.resource, "circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call. Only retryable (transient) failures count
    /// toward the threshold.
    pub fn record_failure(&self, category: ErrorCategory) {
        if category != ErrorCategory::Transient {
            return;
        }
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(
                    resource = %self.resource,
                    "half-open trial failed, reopening circuit"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        resource = %self.resource,
                        failures = inner.consecutive_failures,
                        threshold = self.failure_threshold,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            resource: self.resource.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_opened: inner.opened_at.map(|at| at.elapsed().as_secs_f64()),
        }
    }

    fn open_error(&self, retry_after: Duration) -> OrchestratorError {
        OrchestratorError::CircuitOpen {
            resource: self.resource.clone(),
            retry_after_secs: retry_after.as_secs_f64(),
        }
    }
}

/// Per-resource breakers shared across all concurrent workers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    pub fn get_or_create(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    resource,
                    self.failure_threshold,
                    self.cooldown,
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        statuses.sort_by(|a, b| a.resource.cmp(&b.resource));
        statuses
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
