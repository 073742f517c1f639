/*
 * Testflow Orchestration - Resumable Test Execution Engine
 *
 * Dependency-aware scheduling and failure-resilient execution for large
 * interdependent test suites.
 *
 * Architecture:
 * - Execution State Machine (checkpointed, resume-from-failure)
 * - Dependency Graph / Affected-Set Selection
 * - Layered Parallel Planning
 * - Circuit Breaker + Exponential Backoff Retry
 * - Performance Regression Detection
 */

// Public modules
pub mod circuit_breaker;
pub mod config;
pub mod dependency_graph;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod performance;
pub mod retry;
pub mod selector;
pub mod state;
pub mod state_manager;
pub mod store;

// Re-exports
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStatus, CircuitState,
};
pub use config::OrchestratorConfig;
pub use dependency_graph::{DependencyGraph, PriorityTier, TestMetadata};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use executor::{
    ChangeSource, ExecutionOutcome, NotificationSink, StateEvent, TestExecutor, TracingSink,
};
pub use orchestrator::{StopHandle, TestRunOrchestrator};
pub use performance::{PerformanceAlert, PerformanceDetector};
pub use retry::RetryPolicy;
pub use selector::{ExecutionPlan, TestSelector};
pub use state::{
    ArtifactKind, CheckpointStatus, ExecutionState, FailureDetail, RunStatus, RunSummary,
    SkipReason, TestArtifact, TestCheckpoint,
};
pub use state_manager::StateManager;
pub use store::{InMemoryStateStore, StateStore};
