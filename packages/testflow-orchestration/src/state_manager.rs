//! Single-writer owner of the canonical execution state.
//!
//! Every checkpoint transition is flushed durably through the store before
//! the call returns, so a crash mid-run loses at most the in-flight
//! checkpoint's final status, never prior history. The state mutex is held
//! across the flush: transitions serialize, one writer per run.

use crate::error::{OrchestratorError, Result};
use crate::executor::{NotificationSink, StateEvent};
use crate::state::{
    CheckpointStatus, ExecutionState, RunStatus, RunSummary, SkipReason, TestArtifact,
    TestCheckpoint,
};
use crate::store::StateStore;
use std::sync::Arc;
use tracing::{info, warn};

pub struct StateManager {
    state: tokio::sync::Mutex<ExecutionState>,
    store: Arc<dyn StateStore>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl StateManager {
    /// Load the persisted state for `run_id` or create a fresh one.
    pub async fn open_or_create(
        run_id: &str,
        store: Arc<dyn StateStore>,
        sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> Result<Self> {
        let state = match store.load(run_id).await? {
            Some(state) => {
                info!(
                    run_id,
                    checkpoints = state.checkpoints.len(),
                    status = %state.status,
                    "loaded persisted execution state"
                );
                state
            }
            None => ExecutionState::new(run_id)?,
        };

        Ok(Self {
            state: tokio::sync::Mutex::new(state),
            store,
            sinks,
        })
    }

    /// Eventually-consistent copy of the state for progress reporting.
    pub async fn snapshot(&self) -> ExecutionState {
        self.state.lock().await.clone()
    }

    pub async fn summary(&self) -> RunSummary {
        self.state.lock().await.summary()
    }

    /// Seed pending checkpoints for planned tests that have none yet.
    /// Marks the run as running.
    pub async fn register_checkpoints<I, S>(&self, test_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().await;
        for test_id in test_ids {
            let test_id = test_id.as_ref();
            if state.checkpoint(test_id).is_none() {
                state.checkpoints.push(TestCheckpoint::new(test_id)?);
            }
        }
        state.status = RunStatus::Running;
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_run(&state);
        Ok(())
    }

    /// Transition a test's checkpoint to running.
    ///
    /// Fails with `InvalidTransition` when the checkpoint is already
    /// terminal or running.
    pub async fn begin(&self, test_id: &str) -> Result<TestCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state
            .checkpoint_mut(test_id)
            .ok_or_else(|| OrchestratorError::TestNotFound(test_id.to_string()))?;
        cp.start()?;
        let snapshot = cp.clone();
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_checkpoint(&state, &snapshot);
        Ok(snapshot)
    }

    /// Record a terminal outcome for a running checkpoint.
    pub async fn complete(
        &self,
        test_id: &str,
        status: CheckpointStatus,
        artifacts: Vec<TestArtifact>,
        last_error: Option<String>,
    ) -> Result<TestCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state
            .checkpoint_mut(test_id)
            .ok_or_else(|| OrchestratorError::TestNotFound(test_id.to_string()))?;
        cp.finish(status, artifacts, last_error)?;
        let snapshot = cp.clone();
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_checkpoint(&state, &snapshot);
        Ok(snapshot)
    }

    /// Skip a pending checkpoint.
    pub async fn skip(&self, test_id: &str, reason: SkipReason) -> Result<TestCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state
            .checkpoint_mut(test_id)
            .ok_or_else(|| OrchestratorError::TestNotFound(test_id.to_string()))?;
        cp.skip(reason)?;
        let snapshot = cp.clone();
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_checkpoint(&state, &snapshot);
        Ok(snapshot)
    }

    /// Clone a fresh pending checkpoint for the next attempt of a failed
    /// test, linked to the previous attempt.
    pub async fn retry(&self, test_id: &str) -> Result<TestCheckpoint> {
        let mut state = self.state.lock().await;
        let cp = state
            .checkpoint(test_id)
            .ok_or_else(|| OrchestratorError::TestNotFound(test_id.to_string()))?;
        let clone = cp.retry_clone()?;
        let snapshot = clone.clone();
        state.checkpoints.push(clone);
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_checkpoint(&state, &snapshot);
        Ok(snapshot)
    }

    /// Resume from the last persisted state.
    ///
    /// Idempotent: returns exactly the checkpoints that were not terminal,
    /// in original order. A checkpoint left running is failed-by-interruption
    /// and replaced by a fresh retry attempt, which takes its place in the
    /// returned sequence.
    pub async fn resume(&self) -> Result<Vec<TestCheckpoint>> {
        let mut state = self.state.lock().await;
        let mut resumed = Vec::new();
        let mut inserts = Vec::new();

        for (idx, cp) in state.checkpoints.iter_mut().enumerate() {
            match cp.status {
                CheckpointStatus::Pending => resumed.push(cp.clone()),
                CheckpointStatus::Running => {
                    warn!(
                        test_id = %cp.test_id,
                        attempt = cp.attempt,
                        "checkpoint interrupted by restart, marking failed"
                    );
                    cp.finish(
                        CheckpointStatus::Failed,
                        Vec::new(),
                        Some("interrupted by process restart".to_string()),
                    )?;
                    let retry = cp.retry_clone()?;
                    resumed.push(retry.clone());
                    inserts.push((idx + 1, retry));
                }
                _ => {}
            }
        }

        // Retry attempts slot in right after the attempt they replace, so a
        // repeated resume sees the same order.
        for (offset, (idx, retry)) in inserts.into_iter().enumerate() {
            state.checkpoints.insert(idx + offset, retry);
        }
        if !resumed.is_empty() {
            state.status = RunStatus::Running;
        }
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;

        Ok(resumed)
    }

    /// Mark the run paused. In-flight checkpoints finish naturally; pending
    /// ones stay pending for a later resume.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                test_id: state.run_id.clone(),
                from: state.status.as_str().to_string(),
                to: RunStatus::Paused.as_str().to_string(),
            });
        }
        state.status = RunStatus::Paused;
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_run(&state);
        Ok(())
    }

    /// Close out the run: failed if any test's latest attempt failed,
    /// completed otherwise.
    pub async fn finish(&self) -> Result<RunSummary> {
        let mut state = self.state.lock().await;
        let summary = state.summary();
        state.status = if summary.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        state.updated_at = chrono::Utc::now();
        self.flush(&state).await?;
        self.notify_run(&state);

        let mut summary = summary;
        summary.status = state.status;
        Ok(summary)
    }

    /// Latest checkpoint status for a test.
    pub async fn checkpoint_status(&self, test_id: &str) -> Option<CheckpointStatus> {
        self.state
            .lock()
            .await
            .checkpoint(test_id)
            .map(|cp| cp.status)
    }

    async fn flush(&self, state: &ExecutionState) -> Result<()> {
        self.store.save(state).await.map_err(|e| match e {
            OrchestratorError::CheckpointPersistence(_) => e,
            other => OrchestratorError::persistence(other),
        })
    }

    fn notify_run(&self, state: &ExecutionState) {
        let event = StateEvent::RunStatusChanged {
            run_id: state.run_id.clone(),
            status: state.status,
        };
        for sink in &self.sinks {
            sink.state_changed(&event);
        }
    }

    fn notify_checkpoint(&self, state: &ExecutionState, cp: &TestCheckpoint) {
        let event = StateEvent::CheckpointChanged {
            run_id: state.run_id.clone(),
            test_id: cp.test_id.clone(),
            status: cp.status,
            attempt: cp.attempt,
        };
        for sink in &self.sinks {
            sink.state_changed(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ArtifactKind;
    use crate::store::InMemoryStateStore;

    async fn manager(store: Arc<InMemoryStateStore>) -> StateManager {
        StateManager::open_or_create("run-1", store, vec![])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_begin_and_complete_persist_each_transition() {
        let store = Arc::new(InMemoryStateStore::new());
        let mgr = manager(store.clone()).await;

        mgr.register_checkpoints(["login"]).await.unwrap();
        mgr.begin("login").await.unwrap();

        // The running transition is already durable.
        let persisted = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(
            persisted.checkpoint("login").unwrap().status,
            CheckpointStatus::Running
        );

        mgr.complete(
            "login",
            CheckpointStatus::Passed,
            vec![TestArtifact::new(ArtifactKind::Video, "login.webm")],
            None,
        )
        .await
        .unwrap();

        let persisted = store.load("run-1").await.unwrap().unwrap();
        let cp = persisted.checkpoint("login").unwrap();
        assert_eq!(cp.status, CheckpointStatus::Passed);
        assert_eq!(cp.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_begin_terminal_checkpoint_rejected() {
        let store = Arc::new(InMemoryStateStore::new());
        let mgr = manager(store).await;

        mgr.register_checkpoints(["login"]).await.unwrap();
        mgr.begin("login").await.unwrap();
        mgr.complete("login", CheckpointStatus::Passed, vec![], None)
            .await
            .unwrap();

        let err = mgr.begin("login").await;
        assert!(matches!(
            err,
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_test() {
        let store = Arc::new(InMemoryStateStore::new());
        let mgr = manager(store).await;

        mgr.register_checkpoints(["a", "b"]).await.unwrap();
        mgr.register_checkpoints(["a", "b", "c"]).await.unwrap();

        let snapshot = mgr.snapshot().await;
        assert_eq!(snapshot.checkpoints.len(), 3);
        assert_eq!(snapshot.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_resume_returns_only_incomplete_in_order() {
        let store = Arc::new(InMemoryStateStore::new());
        {
            let mgr = manager(store.clone()).await;
            mgr.register_checkpoints(["passed", "interrupted", "pending"])
                .await
                .unwrap();
            mgr.begin("passed").await.unwrap();
            mgr.complete("passed", CheckpointStatus::Passed, vec![], None)
                .await
                .unwrap();
            mgr.begin("interrupted").await.unwrap();
            // Simulated crash: "interrupted" stays running, "pending" untouched.
        }

        let mgr = manager(store.clone()).await;
        let resumed = mgr.resume().await.unwrap();

        let ids: Vec<_> = resumed.iter().map(|cp| cp.test_id.as_str()).collect();
        assert_eq!(ids, vec!["interrupted", "pending"]);

        // The interrupted checkpoint became failed + a linked retry attempt.
        let snapshot = mgr.snapshot().await;
        let latest = snapshot.checkpoint("interrupted").unwrap();
        assert_eq!(latest.status, CheckpointStatus::Pending);
        assert_eq!(latest.attempt, 2);
        assert!(latest.retry_of.is_some());

        // Resume is idempotent.
        let again = mgr.resume().await.unwrap();
        let ids: Vec<_> = again.iter().map(|cp| cp.test_id.as_str()).collect();
        assert_eq!(ids, vec!["interrupted", "pending"]);
    }

    #[tokio::test]
    async fn test_retry_links_attempts() {
        let store = Arc::new(InMemoryStateStore::new());
        let mgr = manager(store).await;

        mgr.register_checkpoints(["flaky"]).await.unwrap();
        mgr.begin("flaky").await.unwrap();
        let failed = mgr
            .complete(
                "flaky",
                CheckpointStatus::Failed,
                vec![],
                Some("timeout".to_string()),
            )
            .await
            .unwrap();

        let retry = mgr.retry("flaky").await.unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.retry_of, Some(failed.id));

        mgr.begin("flaky").await.unwrap();
        mgr.complete("flaky", CheckpointStatus::Passed, vec![], None)
            .await
            .unwrap();

        let summary = mgr.summary().await;
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_pause_rejected_after_finish() {
        let store = Arc::new(InMemoryStateStore::new());
        let mgr = manager(store).await;

        mgr.register_checkpoints(["a"]).await.unwrap();
        mgr.begin("a").await.unwrap();
        mgr.complete("a", CheckpointStatus::Passed, vec![], None)
            .await
            .unwrap();
        let summary = mgr.finish().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);

        assert!(mgr.pause().await.is_err());
    }

    #[tokio::test]
    async fn test_finish_failed_when_any_latest_attempt_failed() {
        let store = Arc::new(InMemoryStateStore::new());
        let mgr = manager(store).await;

        mgr.register_checkpoints(["a", "b"]).await.unwrap();
        mgr.begin("a").await.unwrap();
        mgr.complete("a", CheckpointStatus::Passed, vec![], None)
            .await
            .unwrap();
        mgr.begin("b").await.unwrap();
        mgr.complete(
            "b",
            CheckpointStatus::Failed,
            vec![],
            Some("assertion failed".to_string()),
        )
        .await
        .unwrap();

        let summary = mgr.finish().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].test_id, "b");
    }
}
