//! Group-by-group run driver.
//!
//! Executes the planned parallel groups strictly in order; members of one
//! group run concurrently on spawned workers bounded by the configured
//! worker limit. Checkpoint transitions go through the state manager, so a
//! restarted process resumes from the last incomplete checkpoint instead of
//! rerunning completed work.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStatus};
use crate::config::OrchestratorConfig;
use crate::dependency_graph::{DependencyGraph, TestMetadata};
use crate::error::{OrchestratorError, Result};
use crate::executor::{ChangeSource, NotificationSink, TestExecutor};
use crate::performance::PerformanceDetector;
use crate::retry::RetryPolicy;
use crate::selector::TestSelector;
use crate::state::{CheckpointStatus, RunSummary, SkipReason};
use crate::state_manager::StateManager;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Requests a cooperative stop: in-flight checkpoints finish naturally, no
/// new group starts.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct WorkerContext {
    state: Arc<StateManager>,
    executor: Arc<dyn TestExecutor>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    detector: Arc<PerformanceDetector>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

pub struct TestRunOrchestrator {
    config: OrchestratorConfig,
    graph: Arc<DependencyGraph>,
    selector: TestSelector,
    state: Arc<StateManager>,
    executor: Arc<dyn TestExecutor>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    detector: Arc<PerformanceDetector>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    stop: Arc<AtomicBool>,
}

impl TestRunOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        graph: Arc<DependencyGraph>,
        state: Arc<StateManager>,
        executor: Arc<dyn TestExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.failure_threshold,
            config.cooldown(),
        ));
        let retry_policy = RetryPolicy::from_config(&config);
        let detector = Arc::new(PerformanceDetector::from_config(&config));

        Ok(Self {
            selector: TestSelector::new(graph.clone()),
            graph,
            state,
            executor,
            breakers,
            retry_policy,
            detector,
            sinks: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
        }
    }

    pub fn breaker_status(&self) -> Vec<CircuitBreakerStatus> {
        self.breakers.snapshots()
    }

    pub fn detector(&self) -> &PerformanceDetector {
        &self.detector
    }

    /// Pull changed paths from the change source and run the affected set.
    pub async fn run_for_changes(
        &self,
        change_source: &dyn ChangeSource,
        since_ref: &str,
    ) -> Result<RunSummary> {
        let changed = change_source.changed_paths(since_ref).await?;
        info!(since_ref, changed = changed.len(), "resolved changed paths");
        self.run(&changed).await
    }

    /// Execute the minimal affected subset of tests for the given changes.
    pub async fn run(&self, changed_paths: &BTreeSet<String>) -> Result<RunSummary> {
        let selected = self.selector.select_affected(changed_paths);
        let plan = self.selector.plan_parallel_order(&selected)?;
        info!(
            tests = plan.test_count(),
            groups = plan.len(),
            "execution plan:\n{}",
            plan.describe()
        );

        // Fail interrupted checkpoints from a previous session, then seed
        // checkpoints for newly planned tests.
        let resumed = self.state.resume().await?;
        if !resumed.is_empty() {
            info!(
                resumed = resumed.len(),
                "resuming previously incomplete checkpoints"
            );
        }
        self.state.register_checkpoints(plan.tests()).await?;

        // Work remaining this session; terminal checkpoints from a previous
        // session are never re-executed.
        let snapshot = self.state.snapshot().await;
        let to_run: HashSet<String> = plan
            .tests()
            .filter(|t| {
                snapshot
                    .checkpoint(t)
                    .map(|cp| !cp.status.is_terminal())
                    .unwrap_or(false)
            })
            .map(String::from)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.worker_limit));

        for (group_idx, group) in plan.groups.iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                info!(group = group_idx + 1, "stop requested, pausing run");
                self.state.pause().await?;
                return Ok(self.state.summary().await);
            }

            let members: Vec<String> = group
                .iter()
                .filter(|t| to_run.contains(*t))
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }
            info!(
                group = group_idx + 1,
                tests = members.len(),
                "starting parallel group"
            );

            let runnable = self.gate_on_dependencies(members).await?;

            let mut tasks = Vec::new();
            for test_id in runnable {
                let meta = self
                    .graph
                    .get(&test_id)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::TestNotFound(test_id.clone()))?;

                let ctx = WorkerContext {
                    state: self.state.clone(),
                    executor: self.executor.clone(),
                    breaker: self.breakers.get_or_create(&meta.journey),
                    retry: self.retry_policy.clone(),
                    detector: self.detector.clone(),
                    sinks: self.sinks.clone(),
                };
                let semaphore = semaphore.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| OrchestratorError::Other(anyhow::anyhow!("worker pool closed")))?;
                    Self::run_one_test(ctx, meta).await
                }));
            }

            // Barrier: the next group starts only after every member of
            // this one reached a terminal checkpoint.
            for task in futures::future::join_all(tasks).await {
                match task {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "run aborted");
                        return Err(e);
                    }
                    Err(join_err) => {
                        return Err(OrchestratorError::Other(anyhow::anyhow!(
                            "test worker panicked: {join_err}"
                        )));
                    }
                }
            }
        }

        self.state.finish().await
    }

    /// Skip group members whose dependencies did not pass. Dependencies
    /// without a checkpoint in this run are treated as satisfied.
    async fn gate_on_dependencies(&self, members: Vec<String>) -> Result<Vec<String>> {
        let mut runnable = Vec::new();
        for test_id in members {
            let mut failed_dep = None;
            for dep in self.graph.dependencies_of(&test_id) {
                if let Some(status) = self.state.checkpoint_status(dep).await {
                    if status != CheckpointStatus::Passed {
                        failed_dep = Some(dep.clone());
                        break;
                    }
                }
            }
            match failed_dep {
                Some(dep) => {
                    warn!(
                        test_id = %test_id,
                        dependency = %dep,
                        "dependency did not pass, skipping"
                    );
                    self.state
                        .skip(&test_id, SkipReason::DependencyFailed)
                        .await?;
                }
                None => runnable.push(test_id),
            }
        }
        Ok(runnable)
    }

    /// Run one test to a terminal checkpoint.
    ///
    /// Each attempt is one checkpoint: transient failures fail the current
    /// checkpoint and clone a linked retry attempt. Failures stay contained
    /// to the test; only persistence and transition errors abort the run.
    async fn run_one_test(ctx: WorkerContext, meta: TestMetadata) -> Result<()> {
        let test_id = meta.test_id.clone();

        let result = {
            let state = ctx.state.clone();
            let executor = ctx.executor.clone();
            ctx.retry
                .execute(&ctx.breaker, move |attempt| {
                    let state = state.clone();
                    let executor = executor.clone();
                    let meta = meta.clone();
                    async move {
                        if attempt > 1 {
                            state.retry(&meta.test_id).await?;
                        }
                        state.begin(&meta.test_id).await?;

                        let timeout = Duration::from_millis(meta.timeout_ms);
                        let outcome =
                            match tokio::time::timeout(timeout, executor.execute(&meta)).await {
                                Ok(result) => result,
                                Err(_) => Err(OrchestratorError::Timeout(format!(
                                    "test {} exceeded {}ms",
                                    meta.test_id, meta.timeout_ms
                                ))),
                            };

                        match outcome {
                            Ok(outcome) => {
                                state
                                    .complete(
                                        &meta.test_id,
                                        outcome.status,
                                        outcome.artifacts.clone(),
                                        outcome.failure.clone(),
                                    )
                                    .await?;
                                Ok(outcome)
                            }
                            Err(e) => {
                                if is_fatal(&e) {
                                    return Err(e);
                                }
                                state
                                    .complete(
                                        &meta.test_id,
                                        CheckpointStatus::Failed,
                                        Vec::new(),
                                        Some(e.to_string()),
                                    )
                                    .await?;
                                Err(e)
                            }
                        }
                    }
                })
                .await
        };

        match result {
            Ok(outcome) => {
                if outcome.status == CheckpointStatus::Passed {
                    if let Some(alert) = ctx.detector.observe(&test_id, outcome.duration) {
                        for sink in &ctx.sinks {
                            sink.performance_alert(&alert);
                        }
                    }
                }
                Ok(())
            }
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                // A circuit open before the first attempt leaves the
                // checkpoint pending; drive it to failed so the group
                // barrier and dependents see a terminal status.
                if ctx.state.checkpoint_status(&test_id).await == Some(CheckpointStatus::Pending) {
                    ctx.state.begin(&test_id).await?;
                    ctx.state
                        .complete(
                            &test_id,
                            CheckpointStatus::Failed,
                            Vec::new(),
                            Some(e.to_string()),
                        )
                        .await?;
                }
                warn!(test_id = %test_id, error = %e, "test failed");
                Ok(())
            }
        }
    }
}

fn is_fatal(e: &OrchestratorError) -> bool {
    matches!(
        e,
        OrchestratorError::CheckpointPersistence(_) | OrchestratorError::InvalidTransition { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency_graph::PriorityTier;
    use crate::executor::ExecutionOutcome;
    use crate::store::InMemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct ScriptedExecutor {
        calls: AtomicU32,
        fail_tests: Vec<String>,
    }

    impl ScriptedExecutor {
        fn passing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_tests: vec![],
            }
        }

        fn failing(tests: &[&str]) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_tests: tests.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl TestExecutor for ScriptedExecutor {
        async fn execute(&self, test: &TestMetadata) -> Result<ExecutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_tests.contains(&test.test_id) {
                Ok(ExecutionOutcome::failed(
                    Duration::from_millis(5),
                    "assertion failed",
                ))
            } else {
                Ok(ExecutionOutcome::passed(Duration::from_millis(5)))
            }
        }
    }

    fn metadata() -> Vec<TestMetadata> {
        vec![
            TestMetadata::new("smoke-health", PriorityTier::Smoke, "core").unwrap(),
            TestMetadata::new("auth-suite", PriorityTier::Regression, "auth")
                .unwrap()
                .with_path_patterns(["src/auth/*"]),
            TestMetadata::new("checkout-suite", PriorityTier::Regression, "checkout")
                .unwrap()
                .with_dependencies(["auth-suite"])
                .with_path_patterns(["src/checkout/*"]),
        ]
    }

    async fn orchestrator(
        executor: Arc<dyn TestExecutor>,
    ) -> (TestRunOrchestrator, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let state = Arc::new(
            StateManager::open_or_create("run-1", store.clone(), vec![])
                .await
                .unwrap(),
        );
        let graph = Arc::new(DependencyGraph::build(metadata(), vec![]).unwrap());
        let config = OrchestratorConfig {
            worker_limit: 2,
            max_attempts: 2,
            base_delay_seconds: 0.001,
            max_delay_seconds: 0.01,
            retry_jitter: false,
            ..Default::default()
        };
        let orch = TestRunOrchestrator::new(config, graph, state, executor).unwrap();
        (orch, store)
    }

    #[tokio::test]
    async fn test_run_executes_affected_and_smoke_set() {
        let executor = Arc::new(ScriptedExecutor::passing());
        let (orch, _) = orchestrator(executor.clone()).await;

        let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
        let summary = orch.run(&changed).await.unwrap();

        // auth-suite (match), checkout-suite (dependent), smoke-health (always-run)
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dependency_failure_skips_dependents() {
        let executor = Arc::new(ScriptedExecutor::failing(&["auth-suite"]));
        let (orch, _) = orchestrator(executor).await;

        let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
        let summary = orch.run(&changed).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.passed, 1); // smoke set still ran
        assert_eq!(summary.failures[0].test_id, "auth-suite");
    }

    #[tokio::test]
    async fn test_unrelated_changes_run_only_smoke_set() {
        let executor = Arc::new(ScriptedExecutor::passing());
        let (orch, _) = orchestrator(executor.clone()).await;

        let changed = BTreeSet::from(["docs/readme.md".to_string()]);
        let summary = orch.run(&changed).await.unwrap();

        assert_eq!(summary.passed, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_before_run_pauses_without_executing() {
        let executor = Arc::new(ScriptedExecutor::passing());
        let (orch, _) = orchestrator(executor.clone()).await;

        orch.stop_handle().request_stop();

        let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
        let summary = orch.run(&changed).await.unwrap();

        assert_eq!(summary.status, crate::state::RunStatus::Paused);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.pending, 3);
    }
}
