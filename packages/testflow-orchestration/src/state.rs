use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of one test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one schedulable unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Passed => "passed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CheckpointStatus::Pending),
            "running" => Ok(CheckpointStatus::Running),
            "passed" => Ok(CheckpointStatus::Passed),
            "failed" => Ok(CheckpointStatus::Failed),
            "skipped" => Ok(CheckpointStatus::Skipped),
            _ => Err(OrchestratorError::config(format!(
                "Invalid checkpoint status: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::Passed | CheckpointStatus::Failed | CheckpointStatus::Skipped
        )
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a checkpoint was skipped without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed,
}

/// Kind of evidence a test produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    Video,
    Log,
}

/// Evidence produced by a test attempt. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestArtifact {
    pub kind: ArtifactKind,
    pub path: String,
    pub captured_duration_ms: Option<u64>,
}

impl TestArtifact {
    pub fn new(kind: ArtifactKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            captured_duration_ms: None,
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.captured_duration_ms = Some(ms);
        self
    }
}

/// One unit of schedulable work and its persisted outcome.
///
/// Transitions are monotonic: pending -> running -> {passed|failed|skipped},
/// plus pending -> skipped for dependency failures. A terminal checkpoint
/// never mutates again; a retry is a fresh checkpoint linked via `retry_of`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCheckpoint {
    pub id: Uuid,
    pub test_id: String,
    pub status: CheckpointStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub retry_of: Option<Uuid>,
    pub skip_reason: Option<SkipReason>,
    pub last_error: Option<String>,
    pub artifacts: Vec<TestArtifact>,
}

impl TestCheckpoint {
    pub fn new(test_id: impl Into<String>) -> Result<Self> {
        let test_id = test_id.into();
        if test_id.is_empty() {
            return Err(OrchestratorError::config("test_id must not be empty"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            test_id,
            status: CheckpointStatus::Pending,
            started_at: None,
            completed_at: None,
            attempt: 1,
            retry_of: None,
            skip_reason: None,
            last_error: None,
            artifacts: Vec::new(),
        })
    }

    fn invalid_transition(&self, to: CheckpointStatus) -> OrchestratorError {
        OrchestratorError::InvalidTransition {
            test_id: self.test_id.clone(),
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    /// Transition: PENDING -> RUNNING
    pub fn start(&mut self) -> Result<()> {
        match self.status {
            CheckpointStatus::Pending => {
                self.status = CheckpointStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(self.invalid_transition(CheckpointStatus::Running)),
        }
    }

    /// Transition: RUNNING -> {PASSED|FAILED}
    pub fn finish(
        &mut self,
        status: CheckpointStatus,
        artifacts: Vec<TestArtifact>,
        last_error: Option<String>,
    ) -> Result<()> {
        if !matches!(status, CheckpointStatus::Passed | CheckpointStatus::Failed) {
            return Err(self.invalid_transition(status));
        }
        match self.status {
            CheckpointStatus::Running => {
                self.status = status;
                self.completed_at = Some(Utc::now());
                self.artifacts.extend(artifacts);
                self.last_error = last_error;
                Ok(())
            }
            _ => Err(self.invalid_transition(status)),
        }
    }

    /// Transition: PENDING -> SKIPPED
    pub fn skip(&mut self, reason: SkipReason) -> Result<()> {
        match self.status {
            CheckpointStatus::Pending => {
                self.status = CheckpointStatus::Skipped;
                self.completed_at = Some(Utc::now());
                self.skip_reason = Some(reason);
                Ok(())
            }
            _ => Err(self.invalid_transition(CheckpointStatus::Skipped)),
        }
    }

    /// Clone a fresh pending checkpoint for the next attempt of a failed one.
    pub fn retry_clone(&self) -> Result<TestCheckpoint> {
        if self.status != CheckpointStatus::Failed {
            return Err(self.invalid_transition(CheckpointStatus::Pending));
        }
        Ok(TestCheckpoint {
            id: Uuid::new_v4(),
            test_id: self.test_id.clone(),
            status: CheckpointStatus::Pending,
            started_at: None,
            completed_at: None,
            attempt: self.attempt + 1,
            retry_of: Some(self.id),
            skip_reason: None,
            last_error: None,
            artifacts: Vec::new(),
        })
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Canonical state of one test run, persisted across process restarts.
///
/// Owned exclusively by the state manager; mutated only through checkpoint
/// transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub status: RunStatus,
    pub checkpoints: Vec<TestCheckpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        if run_id.is_empty() {
            return Err(OrchestratorError::config("run_id must not be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            run_id,
            status: RunStatus::NotStarted,
            checkpoints: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Latest checkpoint for a test (retries append new checkpoints).
    pub fn checkpoint(&self, test_id: &str) -> Option<&TestCheckpoint> {
        self.checkpoints.iter().rev().find(|cp| cp.test_id == test_id)
    }

    pub(crate) fn checkpoint_mut(&mut self, test_id: &str) -> Option<&mut TestCheckpoint> {
        self.checkpoints
            .iter_mut()
            .rev()
            .find(|cp| cp.test_id == test_id)
    }

    /// Checkpoints that were not terminal at the last persisted state,
    /// in original order.
    pub fn incomplete_checkpoints(&self) -> Vec<&TestCheckpoint> {
        self.checkpoints
            .iter()
            .filter(|cp| !cp.status.is_terminal())
            .collect()
    }

    /// Aggregate the run into a user-facing summary.
    ///
    /// Counts are per test (latest attempt), not per checkpoint.
    pub fn summary(&self) -> RunSummary {
        let mut seen = std::collections::HashSet::new();
        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            passed: 0,
            failed: 0,
            skipped: 0,
            pending: 0,
            failures: Vec::new(),
        };

        // Walk backwards so the first checkpoint seen per test is its latest.
        for cp in self.checkpoints.iter().rev() {
            if !seen.insert(cp.test_id.clone()) {
                continue;
            }
            match cp.status {
                CheckpointStatus::Passed => summary.passed += 1,
                CheckpointStatus::Failed => {
                    summary.failed += 1;
                    summary.failures.push(FailureDetail {
                        test_id: cp.test_id.clone(),
                        attempts: cp.attempt,
                        last_error: cp.last_error.clone(),
                        artifacts: cp.artifacts.clone(),
                    });
                }
                CheckpointStatus::Skipped => summary.skipped += 1,
                CheckpointStatus::Pending | CheckpointStatus::Running => summary.pending += 1,
            }
        }

        summary.failures.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        summary
    }
}

/// Retry history and evidence for one failed test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub test_id: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub artifacts: Vec<TestArtifact>,
}

/// User-facing run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub failures: Vec<FailureDetail>,
}
