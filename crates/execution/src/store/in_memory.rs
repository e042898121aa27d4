use std::collections::HashMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use molflow_core::{CheckpointId, ExecutionId, OutboxEntryId};

use super::r#trait::{DispatchQuery, ExecutionCommit, ExecutionStore, StoreError};
use crate::model::{Checkpoint, Execution, ExecutionStatus, OutboxEntry};

#[derive(Debug, Default)]
struct Tables {
    executions: HashMap<ExecutionId, Execution>,
    /// Unique index on `(provider_name, idempotency_key)`.
    keys: HashMap<(String, String), ExecutionId>,
    checkpoints: Vec<Checkpoint>,
    outbox: Vec<OutboxEntry>,
}

/// In-memory execution store.
///
/// Intended for tests/dev. Every operation takes one lock over all tables, so a
/// commit is applied entirely or not at all.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    tables: RwLock<Tables>,
    /// Injected fault: fail the next commit targeting this status (`None` = any).
    injected_failure: Mutex<Option<Option<ExecutionStatus>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail after validation and before anything is
    /// written, as if the process died before the transaction committed.
    pub fn fail_next_commit(&self) {
        self.inject(None);
    }

    /// Like [`fail_next_commit`](Self::fail_next_commit), but only for a commit moving to `status`.
    pub fn fail_next_commit_to(&self, status: ExecutionStatus) {
        self.inject(Some(status));
    }

    fn inject(&self, target: Option<ExecutionStatus>) {
        if let Ok(mut slot) = self.injected_failure.lock() {
            *slot = Some(target);
        }
    }

    fn take_injected_failure(&self, status: ExecutionStatus) -> Result<bool, StoreError> {
        let mut slot = self
            .injected_failure
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        match *slot {
            Some(target) if target.is_none_or(|t| t == status) => {
                *slot = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut tables = self.write()?;

        let key = (
            execution.provider_name.clone(),
            execution.idempotency_key.clone(),
        );
        if tables.keys.contains_key(&key) {
            return Err(StoreError::UniqueViolation {
                provider_name: key.0,
                idempotency_key: key.1,
            });
        }
        if tables.executions.contains_key(&execution.execution_id) {
            return Err(StoreError::Storage(format!(
                "duplicate execution id {}",
                execution.execution_id
            )));
        }

        tables.keys.insert(key, execution.execution_id);
        tables
            .executions
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        Ok(self.read()?.executions.get(&execution_id).cloned())
    }

    async fn find_by_key(
        &self,
        provider_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let tables = self.read()?;
        let key = (provider_name.to_string(), idempotency_key.to_string());
        Ok(tables
            .keys
            .get(&key)
            .and_then(|id| tables.executions.get(id))
            .cloned())
    }

    async fn commit(&self, commit: ExecutionCommit) -> Result<Execution, StoreError> {
        let mut tables = self.write()?;
        let id = commit.execution_id;

        let current = tables
            .executions
            .get(&id)
            .ok_or(StoreError::NotFound(id))?;

        commit
            .expected_version
            .check(current.version)
            .map_err(|e| StoreError::Conflict {
                execution_id: id,
                reason: e.to_string(),
            })?;
        if current.status.is_terminal() {
            return Err(StoreError::Conflict {
                execution_id: id,
                reason: format!("execution is already {}", current.status),
            });
        }
        if !current.status.can_transition_to(commit.status) {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: commit.status,
            });
        }

        if self.take_injected_failure(commit.status)? {
            return Err(StoreError::Storage("injected commit failure".to_string()));
        }

        // Build every row first, then apply under the same lock.
        let now = Utc::now();
        let observed_version = commit.expected_version.get();
        let updated = Execution {
            status: commit.status,
            payload: commit.payload,
            error: commit.error,
            version: commit.expected_version.next(),
            attempts: commit.attempts,
            retry_at: commit.retry_at,
            updated_at: now,
            ..current.clone()
        };
        let checkpoints: Vec<Checkpoint> = commit
            .checkpoints
            .into_iter()
            .map(|c| Checkpoint {
                id: CheckpointId::new(),
                execution_id: id,
                step: c.step,
                data: c.data,
                version: observed_version,
                created_at: now,
            })
            .collect();
        let outbox: Vec<OutboxEntry> = commit
            .outbox
            .into_iter()
            .map(|e| OutboxEntry {
                id: OutboxEntryId::new(),
                execution_id: id,
                event_type: e.event_type,
                payload: e.payload,
                processed: false,
                created_at: now,
            })
            .collect();

        tables.executions.insert(id, updated.clone());
        tables.checkpoints.extend(checkpoints);
        tables.outbox.extend(outbox);
        Ok(updated)
    }

    async fn checkpoints(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self
            .read()?
            .checkpoints
            .iter()
            .filter(|c| c.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn latest_checkpoint(
        &self,
        execution_id: ExecutionId,
        step: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .read()?
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.execution_id == execution_id && c.step == step)
            .cloned())
    }

    async fn outbox_for(&self, execution_id: ExecutionId) -> Result<Vec<OutboxEntry>, StoreError> {
        Ok(self
            .read()?
            .outbox
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn unprocessed_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        Ok(self
            .read()?
            .outbox
            .iter()
            .filter(|e| !e.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_outbox_processed(&self, id: OutboxEntryId) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::Storage(format!("outbox entry not found: {id}")))?;
        if entry.processed {
            return Ok(false);
        }
        entry.processed = true;
        Ok(true)
    }

    async fn list_dispatchable(&self, query: DispatchQuery) -> Result<Vec<Execution>, StoreError> {
        let tables = self.read()?;
        let mut due: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.updated_at);
        due.truncate(query.limit);
        Ok(due)
    }

    async fn list_stalled(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let tables = self.read()?;
        let mut stalled: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Running && e.updated_at <= updated_before
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|e| e.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn delete_execution(&self, execution_id: ExecutionId) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let Some(removed) = tables.executions.remove(&execution_id) else {
            return Ok(false);
        };
        tables
            .keys
            .remove(&(removed.provider_name, removed.idempotency_key));
        tables.checkpoints.retain(|c| c.execution_id != execution_id);
        tables.outbox.retain(|e| e.execution_id != execution_id);
        Ok(true)
    }
}
