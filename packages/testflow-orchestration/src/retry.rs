//! Exponential-backoff retry composed with the circuit breaker.
//!
//! The policy calls through the breaker on each attempt, so an open circuit
//! short-circuits the remaining retries without consuming backoff delay.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.retry_jitter,
        }
    }

    /// Backoff delay after failed attempt `n` (1-based):
    /// `base_delay * 2^(n-1)` capped at `max_delay`, ±25% jitter when
    /// enabled.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw = (base_ms * 2f64.powi(exponent as i32)).min(max_ms);

        let ms = if self.jitter {
            // ±25% jitter to avoid thundering-herd retries.
            (raw * (1.0 + 0.25 * jitter_factor())).max(0.0)
        } else {
            raw
        };

        Duration::from_millis(ms as u64)
    }

    /// Run `op` with up to `max_attempts` tries, gated by `breaker` on each
    /// attempt.
    ///
    /// Non-retryable failures propagate as-is immediately. An open circuit
    /// propagates immediately without sleeping. Exhausting the attempts
    /// surfaces the last failure wrapped in `RetriesExhausted`.
    pub async fn execute<T, F, Fut>(&self, breaker: &CircuitBreaker, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            // An open circuit fails the whole call fast, remaining retries
            // included.
            breaker.preflight()?;

            match op(attempt).await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    let category = e.category();
                    breaker.record_failure(category);

                    if category != ErrorCategory::Transient {
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        warn!(
                            attempts = self.max_attempts,
                            error = %e,
                            "retries exhausted"
                        );
                        return Err(OrchestratorError::RetriesExhausted {
                            attempts: self.max_attempts,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = self.delay_after_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Jitter factor in [-1.0, 1.0] from a simple LCG.
///
/// Only needs to break retry synchronization across workers, not be
/// cryptographically random.
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    if SEED.load(Ordering::Relaxed) == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x9E37_79B9, |d| d.as_nanos() as u64 | 1);
        SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    let old = SEED.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
        Some(x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407))
    });
    (old.unwrap_or(42) as f64 / u64::MAX as f64) * 2.0 - 1.0
}
