//! Idempotency guard: one execution per `(provider_name, idempotency_key)`.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::error::ExecutionError;
use crate::model::Execution;
use crate::provider::{UnitOfWork, ValidationError};
use crate::store::{ExecutionStore, StoreError};

/// Lookup-before-create backed by the store's uniqueness constraint.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn ExecutionStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Return the execution for `(unit.name(), idempotency_key)`, creating it if absent.
    ///
    /// The flag is `true` only for the caller whose insert created the row. A
    /// concurrent caller that loses the insert race gets the winner's row.
    /// Validation runs first, so an invalid payload never touches the store.
    pub async fn obtain_or_create(
        &self,
        unit: &dyn UnitOfWork,
        idempotency_key: &str,
        payload: JsonValue,
    ) -> Result<(Execution, bool), ExecutionError> {
        if idempotency_key.trim().is_empty() {
            return Err(ValidationError::new("idempotency_key must not be empty").into());
        }
        unit.validate(&payload)?;

        let provider_name = unit.name();
        if let Some(existing) = self.store.find_by_key(provider_name, idempotency_key).await? {
            return Ok((existing, false));
        }

        let execution = Execution::new(provider_name, idempotency_key, payload);
        match self.store.insert(&execution).await {
            Ok(()) => {
                info!(
                    execution_id = %execution.execution_id,
                    provider = %provider_name,
                    "execution created"
                );
                Ok((execution, true))
            }
            Err(StoreError::UniqueViolation { .. }) => {
                debug!(
                    provider = %provider_name,
                    idempotency_key,
                    "lost idempotency race; returning winner"
                );
                let winner = self
                    .store
                    .find_by_key(provider_name, idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Storage(format!(
                            "execution for key '{idempotency_key}' vanished after uniqueness violation"
                        ))
                    })?;
                Ok((winner, false))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointAccessor;
    use crate::model::ExecutionStatus;
    use crate::provider::{WorkError, WorkOutcome};
    use crate::store::InMemoryExecutionStore;
    use crate::model::{Checkpoint, OutboxEntry};
    use crate::store::{DispatchQuery, ExecutionCommit};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use molflow_core::{ExecutionId, OutboxEntryId};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Echo;

    #[async_trait]
    impl UnitOfWork for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn validate(&self, payload: &JsonValue) -> Result<(), ValidationError> {
            payload
                .get("value")
                .map(|_| ())
                .ok_or_else(|| ValidationError::new("missing value"))
        }

        async fn execute(
            &self,
            payload: JsonValue,
            _checkpoints: &mut CheckpointAccessor,
        ) -> Result<WorkOutcome, WorkError> {
            Ok(WorkOutcome::Completed(payload))
        }
    }

    #[tokio::test]
    async fn second_call_returns_the_first_row_unchanged() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let guard = IdempotencyGuard::new(store);

        let (first, created) = guard
            .obtain_or_create(&Echo, "k", json!({"value": 1}))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.status, ExecutionStatus::Pending);

        let (second, created) = guard
            .obtain_or_create(&Echo, "k", json!({"value": 2}))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.payload, json!({"value": 1}));
    }

    #[tokio::test]
    async fn invalid_payload_creates_nothing() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let guard = IdempotencyGuard::new(store.clone());

        let err = guard
            .obtain_or_create(&Echo, "k", json!({"other": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
        assert!(store.find_by_key("echo", "k").await.unwrap().is_none());

        let err = guard
            .obtain_or_create(&Echo, "  ", json!({"value": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_agree_on_one_execution() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let guard = IdempotencyGuard::new(store.clone());

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let guard = guard.clone();
                tokio::spawn(async move {
                    guard
                        .obtain_or_create(&Echo, "race", json!({"value": i}))
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        let mut created = 0;
        for task in tasks {
            let (execution, was_created) = task.await.unwrap().unwrap();
            ids.push(execution.execution_id);
            created += usize::from(was_created);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
    }

    /// Misses the first lookup, as a caller does when a concurrent insert
    /// lands between its lookup and its own insert.
    struct LateLookup {
        inner: InMemoryExecutionStore,
        missed: AtomicBool,
    }

    #[async_trait]
    impl ExecutionStore for LateLookup {
        async fn insert(&self, execution: &Execution) -> Result<(), StoreError> {
            self.inner.insert(execution).await
        }

        async fn get(&self, execution_id: ExecutionId) -> Result<Option<Execution>, StoreError> {
            self.inner.get(execution_id).await
        }

        async fn find_by_key(
            &self,
            provider_name: &str,
            idempotency_key: &str,
        ) -> Result<Option<Execution>, StoreError> {
            if !self.missed.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_by_key(provider_name, idempotency_key).await
        }

        async fn commit(&self, commit: ExecutionCommit) -> Result<Execution, StoreError> {
            self.inner.commit(commit).await
        }

        async fn checkpoints(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, StoreError> {
            self.inner.checkpoints(execution_id).await
        }

        async fn latest_checkpoint(
            &self,
            execution_id: ExecutionId,
            step: &str,
        ) -> Result<Option<Checkpoint>, StoreError> {
            self.inner.latest_checkpoint(execution_id, step).await
        }

        async fn outbox_for(&self, execution_id: ExecutionId) -> Result<Vec<OutboxEntry>, StoreError> {
            self.inner.outbox_for(execution_id).await
        }

        async fn unprocessed_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
            self.inner.unprocessed_outbox(limit).await
        }

        async fn mark_outbox_processed(&self, id: OutboxEntryId) -> Result<bool, StoreError> {
            self.inner.mark_outbox_processed(id).await
        }

        async fn list_dispatchable(&self, query: DispatchQuery) -> Result<Vec<Execution>, StoreError> {
            self.inner.list_dispatchable(query).await
        }

        async fn list_stalled(
            &self,
            updated_before: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Execution>, StoreError> {
            self.inner.list_stalled(updated_before, limit).await
        }

        async fn delete_execution(&self, execution_id: ExecutionId) -> Result<bool, StoreError> {
            self.inner.delete_execution(execution_id).await
        }
    }

    #[tokio::test]
    async fn losing_the_insert_race_returns_the_winner() {
        let inner = InMemoryExecutionStore::new();
        let winner = Execution::new("echo", "race", json!({"value": "first"}));
        inner.insert(&winner).await.unwrap();

        let store = Arc::new(LateLookup {
            inner,
            missed: AtomicBool::new(false),
        });
        let guard = IdempotencyGuard::new(store.clone());

        let (execution, created) = guard
            .obtain_or_create(&Echo, "race", json!({"value": "second"}))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(execution.execution_id, winner.execution_id);
        assert_eq!(execution.payload, json!({"value": "first"}));
        assert!(store.missed.load(Ordering::SeqCst));
    }
}
