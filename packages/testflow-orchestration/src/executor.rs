//! Seams to the external collaborators: test execution, change detection
//! and notification delivery. The core is agnostic to what sits behind
//! them.

use crate::dependency_graph::TestMetadata;
use crate::error::Result;
use crate::performance::PerformanceAlert;
use crate::state::{CheckpointStatus, RunStatus, TestArtifact};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

/// Result of running one test once.
///
/// A test that ran to completion with failing assertions reports
/// `status: Failed` here; an `Err` from the executor means the attempt
/// itself could not be carried out (network, tooling) and is subject to
/// retry classification.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: CheckpointStatus,
    pub duration: Duration,
    pub artifacts: Vec<TestArtifact>,
    pub failure: Option<String>,
}

impl ExecutionOutcome {
    pub fn passed(duration: Duration) -> Self {
        Self {
            status: CheckpointStatus::Passed,
            duration,
            artifacts: Vec::new(),
            failure: None,
        }
    }

    pub fn failed(duration: Duration, failure: impl Into<String>) -> Self {
        Self {
            status: CheckpointStatus::Failed,
            duration,
            artifacts: Vec::new(),
            failure: Some(failure.into()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<TestArtifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Runs one test attempt. Called once per checkpoint attempt.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, test: &TestMetadata) -> Result<ExecutionOutcome>;
}

/// Supplies the changed file paths a run should react to
/// (e.g., a version-control diff).
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn changed_paths(&self, since_ref: &str) -> Result<BTreeSet<String>>;
}

/// State-changed notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    RunStatusChanged {
        run_id: String,
        status: RunStatus,
    },
    CheckpointChanged {
        run_id: String,
        test_id: String,
        status: CheckpointStatus,
        attempt: u32,
    },
}

/// Receives state-changed and performance-alert events. Delivery mechanism
/// is up to the implementor.
pub trait NotificationSink: Send + Sync {
    fn state_changed(&self, event: &StateEvent);

    fn performance_alert(&self, alert: &PerformanceAlert);
}

/// Default sink that logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn state_changed(&self, event: &StateEvent) {
        match event {
            StateEvent::RunStatusChanged { run_id, status } => {
                info!(run_id = %run_id, status = %status, "run status changed");
            }
            StateEvent::CheckpointChanged {
                run_id,
                test_id,
                status,
                attempt,
            } => {
                info!(
                    run_id = %run_id,
                    test_id = %test_id,
                    status = %status,
                    attempt,
                    "checkpoint changed"
                );
            }
        }
    }

    fn performance_alert(&self, alert: &PerformanceAlert) {
        info!(
            test_id = %alert.test_id,
            duration_ms = alert.duration_ms,
            baseline_ms = alert.baseline_ms,
            ratio = alert.ratio,
            "performance alert"
        );
    }
}
