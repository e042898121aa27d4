//! Job worker: drives one execution through the state machine.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use molflow_core::ExecutionId;

use super::policy::{decide, OutcomeKind, Settlement};
use crate::checkpoint::{CheckpointAccessor, CheckpointManager};
use crate::config::ExecutionConfig;
use crate::error::ExecutionError;
use crate::model::{Execution, ExecutionMeta, ExecutionStatus, NewCheckpoint};
use crate::outbox::{
    EXECUTION_BROKEN, EXECUTION_CANCELLED, EXECUTION_FAILED, EXECUTION_RETRY_SCHEDULED,
    EXECUTION_SUCCEEDED, EXECUTION_SUSPENDED,
};
use crate::provider::{Provider, UnitOfWork, WorkError, WorkOutcome};
use crate::registry::ProviderRegistry;
use crate::store::{ExecutionCommit, ExecutionStore};

/// Runs executions against the store.
///
/// The worker holds no per-execution state: every decision is made from the
/// row it just read, and every write is a compare-and-write on that row's
/// version. Two workers racing on one execution therefore resolve in the
/// store, and the loser returns without side effects.
pub struct Worker {
    store: Arc<dyn ExecutionStore>,
    registry: ProviderRegistry,
    checkpoints: CheckpointManager,
    config: ExecutionConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: ProviderRegistry,
        config: ExecutionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            checkpoints: CheckpointManager::new(store.clone()),
            store,
            registry,
            config,
        })
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Caller-facing handle for the provider registered as `name`.
    pub fn provider(self: &Arc<Self>, name: &str) -> Result<Provider, ExecutionError> {
        let unit = self
            .registry
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownProvider(name.to_string()))?;
        Ok(Provider::new(unit, Arc::clone(self)))
    }

    pub async fn status(&self, execution_id: ExecutionId) -> Result<ExecutionMeta, ExecutionError> {
        Ok(self.load(execution_id).await?.meta())
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Execution, ExecutionError> {
        self.store
            .get(execution_id)
            .await?
            .ok_or(ExecutionError::NotFound(execution_id))
    }

    /// Run one attempt of `execution_id` if it is runnable.
    ///
    /// Safe to call on any execution: a terminal, running or otherwise
    /// ineligible execution is returned unchanged.
    #[instrument(skip_all, fields(execution_id = %execution_id))]
    pub async fn run(&self, execution_id: ExecutionId) -> Result<ExecutionMeta, ExecutionError> {
        let execution = self.load(execution_id).await?;
        if !execution.status.is_runnable() {
            debug!(status = %execution.status, "execution not runnable; nothing to do");
            return Ok(execution.meta());
        }

        let unit = self
            .registry
            .get(&execution.provider_name)
            .ok_or_else(|| ExecutionError::UnknownProvider(execution.provider_name.clone()))?;

        if execution.status == ExecutionStatus::WaitingRetry
            && !self.config.retry.should_retry(execution.attempts)
        {
            let commit = ExecutionCommit::transition(&execution, ExecutionStatus::Broken)
                .with_error(Some(format!(
                    "retry budget exhausted after {} attempts",
                    execution.attempts
                )))
                .emit(EXECUTION_BROKEN);
            return self.commit_or_observe(commit).await;
        }

        let claim = ExecutionCommit::transition(&execution, ExecutionStatus::Running)
            .with_attempts(execution.attempts + 1);
        let running = match self.store.commit(claim).await {
            Ok(running) => running,
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "lost claim race; another writer owns the execution");
                return self.status(execution_id).await;
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            provider = %running.provider_name,
            attempt = running.attempts,
            "execution claimed"
        );

        let mut accessor = self.checkpoints.open(&running).await?;
        let outcome = self
            .invoke(unit.as_ref(), running.payload.clone(), &mut accessor)
            .await;

        let (kind, payload, error) = match outcome {
            Ok(WorkOutcome::Completed(payload)) => (OutcomeKind::Completed, payload, None),
            Ok(WorkOutcome::Suspended(payload)) => (OutcomeKind::Suspended, payload, None),
            Err(e) => {
                warn!(kind = ?e.kind, error = %e.message, "attempt failed");
                (
                    OutcomeKind::Failed(e.kind),
                    running.payload.clone(),
                    Some(e.message),
                )
            }
        };

        let settlement = decide(kind, running.attempts, &self.config.retry, seed(&running));
        let commit = settle(&running, settlement, payload, error, accessor.into_pending());
        self.commit_or_observe(commit).await
    }

    /// Run `execution_id` on a spawned task.
    pub fn dispatch(
        self: &Arc<Self>,
        execution_id: ExecutionId,
    ) -> JoinHandle<Result<ExecutionMeta, ExecutionError>> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let result = worker.run(execution_id).await;
            if let Err(e) = &result {
                error!(execution_id = %execution_id, error = %e, "dispatched run failed");
            }
            result
        })
    }

    /// Move a non-terminal execution to `CANCELLED`.
    ///
    /// Retries on version conflicts until the cancel lands or the execution is
    /// observed terminal. A worker mid-flight then loses its settlement commit
    /// and abandons its result.
    #[instrument(skip_all, fields(execution_id = %execution_id))]
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<ExecutionMeta, ExecutionError> {
        loop {
            let current = self.load(execution_id).await?;
            if current.status.is_terminal() {
                debug!(status = %current.status, "already terminal; cancel is a no-op");
                return Ok(current.meta());
            }

            let commit = ExecutionCommit::transition(&current, ExecutionStatus::Cancelled)
                .emit(EXECUTION_CANCELLED);
            match self.store.commit(commit).await {
                Ok(cancelled) => {
                    info!(from = %current.status, "execution cancelled");
                    return Ok(cancelled.meta());
                }
                Err(e) if e.is_conflict() => {
                    debug!(error = %e, "cancel raced another writer; re-reading");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Settle a `RUNNING` execution whose worker stopped writing.
    ///
    /// Treated as a transient failure of the current attempt, so it moves to
    /// `WAITING_RETRY` or, with the budget spent, `BROKEN`.
    #[instrument(skip(self, stalled), fields(execution_id = %stalled.execution_id))]
    pub async fn reap(&self, stalled: &Execution) -> Result<ExecutionMeta, ExecutionError> {
        if stalled.status != ExecutionStatus::Running {
            return self.status(stalled.execution_id).await;
        }
        warn!(
            attempt = stalled.attempts,
            updated_at = %stalled.updated_at,
            "reaping stalled execution"
        );

        let error = format!(
            "worker lease expired during attempt {}",
            stalled.attempts
        );
        let settlement = decide(
            OutcomeKind::Failed(crate::provider::ErrorKind::Transient),
            stalled.attempts,
            &self.config.retry,
            seed(stalled),
        );
        let commit = settle(stalled, settlement, stalled.payload.clone(), Some(error), Vec::new());
        self.commit_or_observe(commit).await
    }

    async fn invoke(
        &self,
        unit: &dyn UnitOfWork,
        payload: JsonValue,
        accessor: &mut CheckpointAccessor,
    ) -> Result<WorkOutcome, WorkError> {
        let timeout = self.config.work_timeout;
        match tokio::time::timeout(timeout, unit.execute(payload, accessor)).await {
            Ok(result) => result,
            Err(_) => Err(WorkError::transient(format!(
                "unit of work timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Apply a settlement commit. A lost version race abandons the result.
    async fn commit_or_observe(
        &self,
        commit: ExecutionCommit,
    ) -> Result<ExecutionMeta, ExecutionError> {
        let execution_id = commit.execution_id;
        let attempted = commit.status;

        match self.store.commit(commit).await {
            Ok(updated) => {
                info!(
                    execution_id = %execution_id,
                    status = %updated.status,
                    attempts = updated.attempts,
                    "execution settled"
                );
                Ok(updated.meta())
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    execution_id = %execution_id,
                    attempted = %attempted,
                    error = %e,
                    "execution changed underneath the worker; abandoning result"
                );
                self.status(execution_id).await
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the commit for `settlement` of a `RUNNING` execution.
fn settle(
    running: &Execution,
    settlement: Settlement,
    payload: JsonValue,
    error: Option<String>,
    checkpoints: Vec<NewCheckpoint>,
) -> ExecutionCommit {
    let commit = |status| {
        ExecutionCommit::transition(running, status)
            .with_payload(payload.clone())
            .with_checkpoints(checkpoints.clone())
    };

    match settlement {
        Settlement::Succeed => commit(ExecutionStatus::Succeeded)
            .with_error(None)
            .emit(EXECUTION_SUCCEEDED),
        Settlement::Suspend => commit(ExecutionStatus::WaitingResume)
            .with_error(None)
            .emit(EXECUTION_SUSPENDED),
        Settlement::Retry { delay } => {
            let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            commit(ExecutionStatus::WaitingRetry)
                .with_error(error)
                .with_retry_at(Some(retry_at))
                .emit(EXECUTION_RETRY_SCHEDULED)
        }
        Settlement::Fail => commit(ExecutionStatus::Failed)
            .with_error(error)
            .emit(EXECUTION_FAILED),
        Settlement::Break => commit(ExecutionStatus::Broken)
            .with_error(error)
            .emit(EXECUTION_BROKEN),
    }
}

/// Per-execution jitter seed.
fn seed(execution: &Execution) -> u64 {
    execution.execution_id.as_uuid().as_u64_pair().1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryExecutionStore;
    use crate::worker::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails transiently `failures` times, then completes.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UnitOfWork for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn validate(&self, _payload: &JsonValue) -> Result<(), crate::provider::ValidationError> {
            Ok(())
        }

        async fn execute(
            &self,
            payload: JsonValue,
            _checkpoints: &mut CheckpointAccessor,
        ) -> Result<WorkOutcome, WorkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(WorkError::transient(format!("tool unavailable (call {call})")))
            } else {
                Ok(WorkOutcome::Completed(json!({"done": true, "input": payload})))
            }
        }
    }

    fn worker(failures: usize, retry: RetryPolicy) -> (Arc<Worker>, Arc<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let mut registry = ProviderRegistry::new();
        registry
            .register(Flaky {
                failures,
                calls: AtomicUsize::new(0),
            })
            .unwrap();
        let config = ExecutionConfig::inline().with_retry(retry);
        (Worker::new(store.clone(), registry, config), store)
    }

    async fn pending(store: &InMemoryExecutionStore) -> ExecutionId {
        let execution = Execution::new("flaky", "k", json!({"n": 1}));
        store.insert(&execution).await.unwrap();
        execution.execution_id
    }

    #[tokio::test]
    async fn transient_failure_waits_then_succeeds_on_rerun() {
        let (worker, store) = worker(1, RetryPolicy::fixed(3, Duration::ZERO));
        let id = pending(&store).await;

        let first = worker.run(id).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::WaitingRetry);
        assert_eq!(first.attempts, 1);
        assert!(first.error.is_some());

        let second = worker.run(id).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Succeeded);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.error, None);

        let events: Vec<_> = store
            .outbox_for(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec![EXECUTION_RETRY_SCHEDULED, EXECUTION_SUCCEEDED]);
    }

    #[tokio::test]
    async fn terminal_execution_is_returned_unchanged() {
        let (worker, store) = worker(0, RetryPolicy::default());
        let id = pending(&store).await;

        let done = worker.run(id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Succeeded);

        let again = worker.run(id).await.unwrap();
        assert_eq!(again, done);
        assert_eq!(store.outbox_for(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let (worker, _store) = worker(0, RetryPolicy::default());
        let err = worker.run(ExecutionId::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::NotFound(_)));
    }

    #[tokio::test]
    async fn single_attempt_budget_breaks_on_transient_failure() {
        let (worker, store) = worker(10, RetryPolicy::fixed(1, Duration::ZERO));
        let id = pending(&store).await;

        let settled = worker.run(id).await.unwrap();
        assert_eq!(settled.status, ExecutionStatus::Broken);
        assert_eq!(settled.attempts, 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (worker, store) = worker(0, RetryPolicy::default());
        let id = pending(&store).await;

        let cancelled = worker.cancel(id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        let again = worker.cancel(id).await.unwrap();
        assert_eq!(again, cancelled);

        // Cancelled executions are not runnable.
        assert_eq!(worker.run(id).await.unwrap().status, ExecutionStatus::Cancelled);
        assert_eq!(store.outbox_for(id).await.unwrap().len(), 1);
    }

    #[test]
    fn settle_carries_error_only_on_failures() {
        let execution = Execution::new("p", "k", json!({}));
        let ok = settle(&execution, Settlement::Succeed, json!({}), Some("x".into()), vec![]);
        assert_eq!(ok.error, None);
        assert_eq!(ok.outbox[0].event_type, EXECUTION_SUCCEEDED);

        let retry = settle(
            &execution,
            Settlement::Retry {
                delay: Duration::from_secs(1),
            },
            json!({}),
            Some("boom".into()),
            vec![],
        );
        assert_eq!(retry.status, ExecutionStatus::WaitingRetry);
        assert_eq!(retry.error.as_deref(), Some("boom"));
        assert!(retry.retry_at.is_some());
        assert_eq!(retry.outbox[0].payload["error"], "boom");
    }
}
