//! Execution-time baselines and regression detection.
//!
//! Per-test rolling windows of observed durations; the baseline is a trimmed
//! mean over a bounded trailing window, so a single anomalous run cannot
//! permanently skew it and memory stays bounded in long-lived processes.

use crate::config::OrchestratorConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// Alert emitted when a duration exceeds the baseline by the configured
/// multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub test_id: String,
    pub duration_ms: f64,
    pub baseline_ms: f64,
    pub ratio: f64,
    pub multiplier: f64,
}

pub struct PerformanceDetector {
    windows: DashMap<String, VecDeque<f64>>,
    window: usize,
    min_samples: usize,
    trim_fraction: f64,
    multiplier: f64,
}

impl PerformanceDetector {
    pub fn new(window: usize, min_samples: usize, trim_fraction: f64, multiplier: f64) -> Self {
        Self {
            windows: DashMap::new(),
            window: window.max(1),
            min_samples: min_samples.max(1),
            trim_fraction: trim_fraction.clamp(0.0, 0.49),
            multiplier,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.baseline_window,
            config.baseline_min_samples,
            config.trim_fraction,
            config.regression_multiplier,
        )
    }

    /// Record an observed duration, evicting the oldest sample beyond the
    /// window.
    pub fn record(&self, test_id: &str, duration: Duration) {
        let mut window = self
            .windows
            .entry(test_id.to_string())
            .or_insert_with(VecDeque::new);
        if window.len() == self.window {
            window.pop_front();
        }
        window.push_back(duration.as_secs_f64() * 1000.0);
    }

    /// Baseline duration, undefined until the minimum sample count is met.
    pub fn baseline(&self, test_id: &str) -> Option<Duration> {
        self.baseline_ms(test_id)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    fn baseline_ms(&self, test_id: &str) -> Option<f64> {
        let window = self.windows.get(test_id)?;
        if window.len() < self.min_samples {
            return None;
        }

        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        // Trimmed mean: drop the outlier fraction from each end.
        let drop = (sorted.len() as f64 * self.trim_fraction).floor() as usize;
        let kept = &sorted[drop..sorted.len() - drop];
        Some(kept.iter().sum::<f64>() / kept.len() as f64)
    }

    /// Check a new duration against the baseline without recording it.
    pub fn check_regression(&self, test_id: &str, duration: Duration) -> Option<PerformanceAlert> {
        let baseline_ms = self.baseline_ms(test_id)?;
        let duration_ms = duration.as_secs_f64() * 1000.0;

        if duration_ms > baseline_ms * self.multiplier {
            let alert = PerformanceAlert {
                test_id: test_id.to_string(),
                duration_ms,
                baseline_ms,
                ratio: duration_ms / baseline_ms,
                multiplier: self.multiplier,
            };
            warn!(
                test_id,
                duration_ms,
                baseline_ms,
                ratio = alert.ratio,
                "performance regression detected"
            );
            Some(alert)
        } else {
            None
        }
    }

    /// Check against the current baseline, then fold the duration into the
    /// window.
    pub fn observe(&self, test_id: &str, duration: Duration) -> Option<PerformanceAlert> {
        let alert = self.check_regression(test_id, duration);
        self.record(test_id, duration);
        alert
    }

    /// Number of samples currently held for a test.
    pub fn sample_count(&self, test_id: &str) -> usize {
        self.windows.get(test_id).map(|w| w.len()).unwrap_or(0)
    }
}
