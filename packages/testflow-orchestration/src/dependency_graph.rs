//! Dependency tracking for change-based test selection.
//!
//! Provides:
//! - Reverse dependency index: O(1) lookup for "who depends on this test"
//! - BFS affected-test detection: O(V+E) transitive propagation
//! - Cycle detection that names the offending path

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Scheduling priority. Higher tiers run first within a parallel group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Extended,
    Regression,
    Smoke,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Smoke => "smoke",
            PriorityTier::Regression => "regression",
            PriorityTier::Extended => "extended",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "smoke" => Ok(PriorityTier::Smoke),
            "regression" => Ok(PriorityTier::Regression),
            "extended" => Ok(PriorityTier::Extended),
            _ => Err(OrchestratorError::config(format!(
                "Invalid priority tier: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared shape of one schedulable test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMetadata {
    pub test_id: String,
    pub tier: PriorityTier,
    /// Journey/category the test belongs to; also the guarded-resource key
    /// for circuit breaking.
    pub journey: String,
    /// Tests that must have passed before this one may run.
    pub depends_on: Vec<String>,
    /// Code-path patterns (exact prefix or glob) this test covers.
    pub path_patterns: Vec<String>,
    pub timeout_ms: u64,
}

impl TestMetadata {
    pub fn new(
        test_id: impl Into<String>,
        tier: PriorityTier,
        journey: impl Into<String>,
    ) -> Result<Self> {
        let test_id = test_id.into();
        if test_id.is_empty() {
            return Err(OrchestratorError::config("test_id must not be empty"));
        }
        Ok(Self {
            test_id,
            tier,
            journey: journey.into(),
            depends_on: Vec::new(),
            path_patterns: Vec::new(),
            timeout_ms: 300_000, // 5 minutes
        })
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_path_patterns(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.path_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Always-run tests declare neither dependencies nor path patterns.
    pub fn is_always_run(&self) -> bool {
        self.depends_on.is_empty() && self.path_patterns.is_empty()
    }
}

/// Directed graph of test-to-test and test-to-code-path dependencies.
///
/// Construction validates that every referenced test exists and that the
/// graph is acyclic; an edge is never silently dropped.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    tests: HashMap<String, TestMetadata>,
    /// test_id -> tests that depend on it
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build a graph from test metadata plus explicit `(test, depends_on)`
    /// edges merged into the declared dependencies.
    pub fn build(
        metadata: Vec<TestMetadata>,
        explicit_dependencies: Vec<(String, String)>,
    ) -> Result<Self> {
        let mut tests: HashMap<String, TestMetadata> = HashMap::new();
        for meta in metadata {
            if tests.contains_key(&meta.test_id) {
                return Err(OrchestratorError::config(format!(
                    "Duplicate test id in metadata set: {}",
                    meta.test_id
                )));
            }
            tests.insert(meta.test_id.clone(), meta);
        }

        for (test_id, dep) in explicit_dependencies {
            let meta = tests.get_mut(&test_id).ok_or_else(|| {
                OrchestratorError::MissingDependency(format!(
                    "Explicit dependency references unknown test {}",
                    test_id
                ))
            })?;
            if !meta.depends_on.contains(&dep) {
                meta.depends_on.push(dep);
            }
        }

        // Validate dependencies exist
        for meta in tests.values() {
            for dep in &meta.depends_on {
                if !tests.contains_key(dep) {
                    return Err(OrchestratorError::MissingDependency(format!(
                        "Test {} depends on non-existent test {}",
                        meta.test_id, dep
                    )));
                }
            }
        }

        Self::check_acyclic(&tests)?;

        // Reverse index: dep -> dependents
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for meta in tests.values() {
            for dep in &meta.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(meta.test_id.clone());
            }
        }
        for list in dependents.values_mut() {
            list.sort();
        }

        Ok(Self { tests, dependents })
    }

    /// DFS cycle check reporting the offending path (`a -> b -> a`).
    fn check_acyclic(tests: &HashMap<String, TestMetadata>) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> =
            tests.keys().map(|id| (id.as_str(), Mark::Unvisited)).collect();

        // Deterministic traversal order so the reported path is stable.
        let mut roots: Vec<&str> = tests.keys().map(String::as_str).collect();
        roots.sort();

        fn visit<'a>(
            node: &'a str,
            tests: &'a HashMap<String, TestMetadata>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Result<()> {
            marks.insert(node, Mark::InProgress);
            stack.push(node);

            let mut deps: Vec<&str> = tests[node].depends_on.iter().map(String::as_str).collect();
            deps.sort();

            for dep in deps {
                match marks[dep] {
                    Mark::Done => {}
                    Mark::InProgress => {
                        let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut path: Vec<&str> = stack[start..].to_vec();
                        path.push(dep);
                        return Err(OrchestratorError::CycleDetected {
                            path: path.join(" -> "),
                        });
                    }
                    Mark::Unvisited => visit(dep, tests, marks, stack)?,
                }
            }

            stack.pop();
            marks.insert(node, Mark::Done);
            Ok(())
        }

        let mut stack = Vec::new();
        for root in roots {
            if marks[root] == Mark::Unvisited {
                visit(root, tests, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, test_id: &str) -> Option<&TestMetadata> {
        self.tests.get(test_id)
    }

    pub fn dependencies_of(&self, test_id: &str) -> &[String] {
        self.tests
            .get(test_id)
            .map(|m| m.depends_on.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, test_id: &str) -> &[String] {
        self.dependents
            .get(test_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn test_ids(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Minimal affected subset for a set of changed file paths.
    ///
    /// A test is directly affected when any changed path matches one of its
    /// declared code-path patterns. The result is the BFS transitive closure
    /// over dependents of directly-affected tests, unioned with the
    /// always-run set.
    pub fn select_affected(&self, changed_paths: &BTreeSet<String>) -> BTreeSet<String> {
        let mut affected = BTreeSet::new();
        let mut queue = VecDeque::new();

        for meta in self.tests.values() {
            let directly_affected = meta.path_patterns.iter().any(|pattern| {
                changed_paths
                    .iter()
                    .any(|path| pattern_matches(pattern, path))
            });

            if directly_affected || meta.is_always_run() {
                if affected.insert(meta.test_id.clone()) {
                    queue.push_back(meta.test_id.clone());
                }
            }
        }

        // BFS: transitively pull in dependents
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(&current) {
                if affected.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }

        affected
    }
}

/// Exact, prefix, or glob match of a changed path against a pattern.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    if path == pattern || path.starts_with(pattern) {
        return true;
    }
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(path),
        Err(_) => false,
    }
}
