use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration surface consumed by the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Consecutive transient failures before a circuit opens.
    pub failure_threshold: u32,
    /// Seconds a circuit stays open before the half-open trial.
    pub cooldown_seconds: f64,
    /// Attempts per test call, including the first.
    pub max_attempts: u32,
    /// Backoff base delay before the second attempt.
    pub base_delay_seconds: f64,
    /// Backoff delay cap.
    pub max_delay_seconds: f64,
    /// Apply ±25% jitter to backoff delays.
    pub retry_jitter: bool,
    /// A duration above baseline * multiplier raises a performance alert.
    pub regression_multiplier: f64,
    /// Trailing samples kept per test for baseline computation.
    pub baseline_window: usize,
    /// Samples required before a baseline is defined.
    pub baseline_min_samples: usize,
    /// Fraction trimmed from each end of the sorted window.
    pub trim_fraction: f64,
    /// Concurrent test executions per parallel group.
    pub worker_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 30.0,
            max_attempts: 3,
            base_delay_seconds: 1.0,
            max_delay_seconds: 30.0,
            retry_jitter: true,
            regression_multiplier: 1.5,
            baseline_window: 20,
            baseline_min_samples: 5,
            trim_fraction: 0.1,
            worker_limit: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
        }
    }
}

impl OrchestratorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay_seconds)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(OrchestratorError::config("failure_threshold must be >= 1"));
        }
        if self.max_attempts == 0 {
            return Err(OrchestratorError::config("max_attempts must be >= 1"));
        }
        if self.worker_limit == 0 {
            return Err(OrchestratorError::config("worker_limit must be >= 1"));
        }
        if self.cooldown_seconds < 0.0 || self.base_delay_seconds < 0.0 {
            return Err(OrchestratorError::config("delays must be non-negative"));
        }
        if self.max_delay_seconds < self.base_delay_seconds {
            return Err(OrchestratorError::config(
                "max_delay_seconds must be >= base_delay_seconds",
            ));
        }
        if self.regression_multiplier <= 1.0 {
            return Err(OrchestratorError::config(
                "regression_multiplier must be > 1.0",
            ));
        }
        if self.baseline_window == 0 || self.baseline_min_samples == 0 {
            return Err(OrchestratorError::config(
                "baseline window and minimum sample count must be >= 1",
            ));
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(OrchestratorError::config(
                "trim_fraction must be in [0.0, 0.5)",
            ));
        }
        Ok(())
    }
}
