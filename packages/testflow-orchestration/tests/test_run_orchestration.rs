//! End-to-end orchestration tests: selection, planning, resilient
//! execution, containment and cancellation.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testflow_orchestration::{
    CheckpointStatus, DependencyGraph, ErrorCategory, ExecutionOutcome, InMemoryStateStore,
    NotificationSink, OrchestratorConfig, OrchestratorError, PerformanceAlert, PriorityTier,
    Result, RunStatus, StateEvent, StateManager, StopHandle, TestExecutor, TestMetadata,
    TestRunOrchestrator,
};

/// Scripted outcome for one executor call.
#[derive(Clone)]
enum Step {
    Pass(u64),
    AssertFail,
    TransientError,
    PermanentError,
}

/// Executor driven by per-test scripts; repeats the last step once a script
/// is exhausted and records the order of calls.
struct ScriptedExecutor {
    scripts: parking_lot::Mutex<std::collections::HashMap<String, Vec<Step>>>,
    call_log: parking_lot::Mutex<Vec<String>>,
    stop_on_first_call: parking_lot::Mutex<Option<StopHandle>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            scripts: parking_lot::Mutex::new(std::collections::HashMap::new()),
            call_log: parking_lot::Mutex::new(Vec::new()),
            stop_on_first_call: parking_lot::Mutex::new(None),
        }
    }

    fn script(self, test_id: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(test_id.to_string(), steps);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.call_log.lock().clone()
    }

    fn call_count(&self, test_id: &str) -> usize {
        self.call_log.lock().iter().filter(|t| *t == test_id).count()
    }
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    async fn execute(&self, test: &TestMetadata) -> Result<ExecutionOutcome> {
        self.call_log.lock().push(test.test_id.clone());
        if let Some(handle) = self.stop_on_first_call.lock().take() {
            handle.request_stop();
        }

        let step = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&test.test_id) {
                Some(steps) if steps.len() > 1 => steps.remove(0),
                Some(steps) if steps.len() == 1 => steps[0].clone(),
                _ => Step::Pass(5),
            }
        };

        match step {
            Step::Pass(ms) => Ok(ExecutionOutcome::passed(Duration::from_millis(ms))),
            Step::AssertFail => Ok(ExecutionOutcome::failed(
                Duration::from_millis(5),
                "expected element to be visible",
            )),
            Step::TransientError => Err(OrchestratorError::execution(
                "connection reset by peer",
                ErrorCategory::Transient,
            )),
            Step::PermanentError => Err(OrchestratorError::execution(
                "status 400: validation failed",
                ErrorCategory::Permanent,
            )),
        }
    }
}

/// Sink collecting events and alerts for assertions.
#[derive(Default)]
struct CollectingSink {
    events: parking_lot::Mutex<Vec<StateEvent>>,
    alerts: parking_lot::Mutex<Vec<PerformanceAlert>>,
}

impl NotificationSink for CollectingSink {
    fn state_changed(&self, event: &StateEvent) {
        self.events.lock().push(event.clone());
    }

    fn performance_alert(&self, alert: &PerformanceAlert) {
        self.alerts.lock().push(alert.clone());
    }
}

fn suite_metadata() -> Vec<TestMetadata> {
    vec![
        TestMetadata::new("smoke-health", PriorityTier::Smoke, "core").unwrap(),
        TestMetadata::new("auth-suite", PriorityTier::Regression, "auth")
            .unwrap()
            .with_path_patterns(["src/auth/*"]),
        TestMetadata::new("checkout-suite", PriorityTier::Regression, "checkout")
            .unwrap()
            .with_dependencies(["auth-suite"])
            .with_path_patterns(["src/checkout/*"]),
        TestMetadata::new("report-suite", PriorityTier::Extended, "reports")
            .unwrap()
            .with_dependencies(["checkout-suite"])
            .with_path_patterns(["src/reports/*"]),
    ]
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        worker_limit: 1,
        max_attempts: 3,
        base_delay_seconds: 0.001,
        max_delay_seconds: 0.01,
        retry_jitter: false,
        ..Default::default()
    }
}

async fn build(
    config: OrchestratorConfig,
    store: Arc<InMemoryStateStore>,
    executor: Arc<ScriptedExecutor>,
) -> TestRunOrchestrator {
    let state = Arc::new(
        StateManager::open_or_create("run-1", store, vec![])
            .await
            .unwrap(),
    );
    let graph = Arc::new(DependencyGraph::build(suite_metadata(), vec![]).unwrap());
    TestRunOrchestrator::new(config, graph, state, executor).unwrap()
}

#[tokio::test]
async fn test_full_run_respects_dependency_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store, executor.clone()).await;

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.passed, 4);

    let calls = executor.calls();
    let pos = |id: &str| calls.iter().position(|t| t == id).unwrap();
    assert!(pos("auth-suite") < pos("checkout-suite"));
    assert!(pos("checkout-suite") < pos("report-suite"));
}

#[tokio::test]
async fn test_transient_failure_retried_to_success() {
    let executor = Arc::new(
        ScriptedExecutor::new().script("auth-suite", vec![Step::TransientError, Step::Pass(5)]),
    );
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store.clone(), executor.clone()).await;

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.failed, 0);
    assert_eq!(executor.call_count("auth-suite"), 2);

    // The failed first attempt stays in history, linked from the retry.
    let state = load_state(&store, "run-1").await;
    let attempts: Vec<_> = state
        .checkpoints
        .iter()
        .filter(|cp| cp.test_id == "auth-suite")
        .collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, CheckpointStatus::Failed);
    assert_eq!(attempts[1].status, CheckpointStatus::Passed);
    assert_eq!(attempts[1].attempt, 2);
    assert_eq!(attempts[1].retry_of, Some(attempts[0].id));
}

async fn load_state(
    store: &InMemoryStateStore,
    run_id: &str,
) -> testflow_orchestration::ExecutionState {
    use testflow_orchestration::StateStore;
    store.load(run_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_retries_exhausted_contained_to_one_test() {
    let executor = Arc::new(ScriptedExecutor::new().script(
        "auth-suite",
        vec![
            Step::TransientError,
            Step::TransientError,
            Step::TransientError,
        ],
    ));
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store, executor.clone()).await;

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    // auth-suite exhausted its 3 attempts; dependents were skipped; the
    // smoke set still ran.
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(executor.call_count("auth-suite"), 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.passed, 1);

    let failure = &summary.failures[0];
    assert_eq!(failure.test_id, "auth-suite");
    assert_eq!(failure.attempts, 3);
    assert!(failure.last_error.as_deref().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let executor =
        Arc::new(ScriptedExecutor::new().script("auth-suite", vec![Step::PermanentError]));
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store, executor.clone()).await;

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    assert_eq!(executor.call_count("auth-suite"), 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_assertion_failure_not_retried() {
    let executor = Arc::new(ScriptedExecutor::new().script("auth-suite", vec![Step::AssertFail]));
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store, executor.clone()).await;

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    assert_eq!(executor.call_count("auth-suite"), 1);
    assert_eq!(summary.failed, 1);
    assert!(summary.failures[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("visible"));
}

#[tokio::test]
async fn test_open_circuit_fails_fast_for_same_journey() {
    // Both tests share the "auth" journey; threshold 1 and a long cooldown
    // mean the second test fails fast without reaching the executor.
    let metadata = vec![
        TestMetadata::new("auth-a", PriorityTier::Regression, "auth")
            .unwrap()
            .with_path_patterns(["src/auth/*"]),
        TestMetadata::new("auth-b", PriorityTier::Regression, "auth")
            .unwrap()
            .with_path_patterns(["src/auth/*"]),
    ];
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("auth-a", vec![Step::TransientError])
            .script("auth-b", vec![Step::Pass(5)]),
    );
    let store = Arc::new(InMemoryStateStore::new());
    let state = Arc::new(
        StateManager::open_or_create("run-1", store, vec![])
            .await
            .unwrap(),
    );
    let graph = Arc::new(DependencyGraph::build(metadata, vec![]).unwrap());
    let config = OrchestratorConfig {
        worker_limit: 1,
        max_attempts: 1,
        failure_threshold: 1,
        cooldown_seconds: 600.0,
        base_delay_seconds: 0.001,
        max_delay_seconds: 0.01,
        retry_jitter: false,
        ..Default::default()
    };
    let orch = TestRunOrchestrator::new(config, graph, state, executor.clone()).unwrap();

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    assert_eq!(summary.failed, 2);
    assert_eq!(executor.call_count("auth-a"), 1);
    assert_eq!(executor.call_count("auth-b"), 0); // never invoked

    let breakers = orch.breaker_status();
    assert_eq!(breakers.len(), 1);
    assert_eq!(breakers[0].resource, "auth");
}

#[tokio::test]
async fn test_performance_alert_forwarded_to_sink() {
    let executor =
        Arc::new(ScriptedExecutor::new().script("smoke-health", vec![Step::Pass(100)]));
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(CollectingSink::default());
    let orch = build(fast_config(), store, executor)
        .await
        .with_sink(sink.clone());

    // Pre-seed a ~10ms baseline for the smoke test.
    for _ in 0..5 {
        orch.detector()
            .record("smoke-health", Duration::from_millis(10));
    }

    let changed = BTreeSet::new();
    let summary = orch.run(&changed).await.unwrap();
    assert_eq!(summary.passed, 1);

    let alerts = sink.alerts.lock();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].test_id, "smoke-health");
    assert!(alerts[0].ratio > 1.5);
}

#[tokio::test]
async fn test_stop_request_pauses_between_groups() {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store.clone(), executor.clone()).await;

    // Stop is requested during the first executed test; later groups must
    // not start, and the unfinished work stays pending.
    *executor.stop_on_first_call.lock() = Some(orch.stop_handle());

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let summary = orch.run(&changed).await.unwrap();

    assert_eq!(summary.status, RunStatus::Paused);
    assert!(summary.pending > 0);

    // A fresh orchestrator over the same store picks up exactly the
    // unfinished work.
    let executor2 = Arc::new(ScriptedExecutor::new());
    let orch2 = build(fast_config(), store, executor2.clone()).await;
    let summary = orch2.run(&changed).await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.passed, 4);
    assert!(!executor2.calls().is_empty());
    assert!(executor2.calls().len() < 4); // completed work never re-ran
}

#[tokio::test]
async fn test_run_for_changes_pulls_diff_from_change_source() {
    struct StaticDiff;

    #[async_trait]
    impl testflow_orchestration::ChangeSource for StaticDiff {
        async fn changed_paths(&self, since_ref: &str) -> Result<BTreeSet<String>> {
            assert_eq!(since_ref, "main");
            Ok(BTreeSet::from(["src/auth/login.ts".to_string()]))
        }
    }

    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(InMemoryStateStore::new());
    let orch = build(fast_config(), store, executor.clone())
        .await
        .with_sink(Arc::new(testflow_orchestration::TracingSink));

    let summary = orch.run_for_changes(&StaticDiff, "main").await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.passed, 4);
    assert!(executor.calls().contains(&"auth-suite".to_string()));
}

#[tokio::test]
async fn test_persistence_failure_aborts_run() {
    struct FailingStore {
        saves: AtomicU32,
        fail_after: u32,
    }

    #[async_trait]
    impl testflow_orchestration::StateStore for FailingStore {
        async fn save(
            &self,
            _state: &testflow_orchestration::ExecutionState,
        ) -> Result<()> {
            if self.saves.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(OrchestratorError::CheckpointPersistence(
                    "disk unavailable".to_string(),
                ));
            }
            Ok(())
        }

        async fn load(
            &self,
            _run_id: &str,
        ) -> Result<Option<testflow_orchestration::ExecutionState>> {
            Ok(None)
        }
    }

    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(FailingStore {
        saves: AtomicU32::new(0),
        fail_after: 3,
    });
    let state = Arc::new(
        StateManager::open_or_create("run-1", store, vec![])
            .await
            .unwrap(),
    );
    let graph = Arc::new(DependencyGraph::build(suite_metadata(), vec![]).unwrap());
    let orch = TestRunOrchestrator::new(fast_config(), graph, state, executor).unwrap();

    let changed = BTreeSet::from(["src/auth/login.ts".to_string()]);
    let result = orch.run(&changed).await;

    assert!(matches!(
        result,
        Err(OrchestratorError::CheckpointPersistence(_))
    ));
}
