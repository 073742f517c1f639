use crate::error::{OrchestratorError, Result};
use crate::state::ExecutionState;
use async_trait::async_trait;
use std::collections::HashMap;

/// Durable persistence for execution state.
///
/// Each call is atomic: a successful `save` means the snapshot survives a
/// process crash. Backing technology is up to the implementor.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &ExecutionState) -> Result<()>;

    async fn load(&self, run_id: &str) -> Result<Option<ExecutionState>>;
}

/// In-memory store (interface-first, backs the test suite).
///
/// Snapshots are bincode round-tripped so state goes through the same
/// serialization path a durable backend would use.
pub struct InMemoryStateStore {
    snapshots: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            snapshots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Number of runs with a persisted snapshot.
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        let data = bincode::serialize(state).map_err(OrchestratorError::persistence)?;
        self.snapshots.lock().insert(state.run_id.clone(), data);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<ExecutionState>> {
        let snapshots = self.snapshots.lock();
        match snapshots.get(run_id) {
            Some(data) => {
                let state = bincode::deserialize(data).map_err(OrchestratorError::persistence)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}
