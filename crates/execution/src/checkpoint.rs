//! Step-level progress markers.
//!
//! A unit of work reads and records checkpoints through a [`CheckpointAccessor`]
//! scoped to one attempt. Recorded checkpoints are buffered and persisted with
//! the attempt's settlement commit, so they share its atomicity.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use molflow_core::ExecutionId;

use crate::model::{Checkpoint, Execution, NewCheckpoint};
use crate::store::{ExecutionStore, StoreError};

/// Checkpoint view handed to a unit of work for one attempt.
#[derive(Debug, Clone)]
pub struct CheckpointAccessor {
    execution_id: ExecutionId,
    version: u64,
    history: Vec<Checkpoint>,
    pending: Vec<NewCheckpoint>,
}

impl CheckpointAccessor {
    pub fn new(execution_id: ExecutionId, version: u64, history: Vec<Checkpoint>) -> Self {
        Self {
            execution_id,
            version,
            history,
            pending: Vec::new(),
        }
    }

    /// An accessor with no stored history.
    pub fn empty(execution_id: ExecutionId, version: u64) -> Self {
        Self::new(execution_id, version, Vec::new())
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Execution version this attempt is running against.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Most recent data for `step`, including checkpoints recorded in this attempt.
    pub fn latest(&self, step: &str) -> Option<&JsonValue> {
        self.pending
            .iter()
            .rev()
            .find(|c| c.step == step)
            .map(|c| &c.data)
            .or_else(|| {
                self.history
                    .iter()
                    .rev()
                    .find(|c| c.step == step)
                    .map(|c| &c.data)
            })
    }

    /// Record progress for `step`. Persisted with the attempt's outcome.
    pub fn record(&mut self, step: impl Into<String>, data: JsonValue) {
        self.pending.push(NewCheckpoint {
            step: step.into(),
            data,
        });
    }

    pub fn pending(&self) -> &[NewCheckpoint] {
        &self.pending
    }

    pub fn into_pending(self) -> Vec<NewCheckpoint> {
        self.pending
    }
}

/// Loads checkpoint history from the store.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn ExecutionStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Accessor for the attempt that is about to run `execution`.
    pub async fn open(&self, execution: &Execution) -> Result<CheckpointAccessor, StoreError> {
        let history = self.store.checkpoints(execution.execution_id).await?;
        Ok(CheckpointAccessor::new(
            execution.execution_id,
            execution.version,
            history,
        ))
    }

    pub async fn latest(
        &self,
        execution_id: ExecutionId,
        step: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.store.latest_checkpoint(execution_id, step).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use molflow_core::CheckpointId;
    use serde_json::json;

    fn stored(execution_id: ExecutionId, step: &str, data: JsonValue) -> Checkpoint {
        Checkpoint {
            id: CheckpointId::new(),
            execution_id,
            step: step.to_string(),
            data,
            version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn latest_prefers_this_attempt_over_history() {
        let id = ExecutionId::new();
        let history = vec![
            stored(id, "S", json!({"completed": 5})),
            stored(id, "S", json!({"completed": 10})),
            stored(id, "T", json!("other")),
        ];
        let mut accessor = CheckpointAccessor::new(id, 3, history);
        assert_eq!(accessor.latest("S"), Some(&json!({"completed": 10})));

        accessor.record("S", json!({"completed": 15}));
        assert_eq!(accessor.latest("S"), Some(&json!({"completed": 15})));
        assert_eq!(accessor.latest("T"), Some(&json!("other")));
        assert_eq!(accessor.latest("missing"), None);
        assert_eq!(accessor.into_pending().len(), 1);
    }

    #[tokio::test]
    async fn manager_reads_committed_checkpoints_from_the_store() {
        use crate::model::ExecutionStatus;
        use crate::store::{ExecutionCommit, InMemoryExecutionStore};

        let store = Arc::new(InMemoryExecutionStore::new());
        let manager = CheckpointManager::new(store.clone());
        let execution = Execution::new("p", "k", json!({}));
        store.insert(&execution).await.unwrap();
        let id = execution.execution_id;
        assert!(manager.latest(id, "S").await.unwrap().is_none());

        let running = store
            .commit(ExecutionCommit::transition(&execution, ExecutionStatus::Running))
            .await
            .unwrap();
        let mut accessor = manager.open(&running).await.unwrap();
        accessor.record("S", json!({"completed": 4}));
        let suspended = store
            .commit(
                ExecutionCommit::transition(&running, ExecutionStatus::WaitingResume)
                    .with_checkpoints(accessor.into_pending()),
            )
            .await
            .unwrap();

        let latest = manager.latest(id, "S").await.unwrap().unwrap();
        assert_eq!(latest.data, json!({"completed": 4}));
        assert_eq!(latest.version, running.version);

        let resumed = manager.open(&suspended).await.unwrap();
        assert_eq!(resumed.latest("S"), Some(&json!({"completed": 4})));
        assert!(manager.latest(id, "other").await.unwrap().is_none());
    }
}
