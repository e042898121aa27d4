use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use molflow_core::{ExecutionId, ExpectedVersion, OutboxEntryId};

use crate::model::{
    Checkpoint, Execution, ExecutionStatus, NewCheckpoint, NewOutboxEntry, OutboxEntry,
};

/// Execution store operation error.
///
/// ## Error Categories
///
/// - **Conflict**: the stored version moved (or the row is already terminal)
/// - **UniqueViolation**: `(provider_name, idempotency_key)` already taken
/// - **InvalidTransition**: the commit would break the status state machine
/// - **NotFound**: no such execution
/// - **Storage**: anything the backend reports that is not one of the above
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("version conflict on execution {execution_id}: {reason}")]
    Conflict {
        execution_id: ExecutionId,
        reason: String,
    },

    #[error("execution already exists for provider '{provider_name}' and key '{idempotency_key}'")]
    UniqueViolation {
        provider_name: String,
        idempotency_key: String,
    },

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("execution not found: {0}")]
    NotFound(ExecutionId),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// One atomic write against an execution.
///
/// Status, payload, checkpoints and outbox entries are applied together, and
/// only if the stored version still equals `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCommit {
    pub execution_id: ExecutionId,
    pub provider_name: String,
    pub expected_version: ExpectedVersion,
    pub status: ExecutionStatus,
    pub payload: JsonValue,
    pub error: Option<String>,
    pub attempts: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub checkpoints: Vec<NewCheckpoint>,
    pub outbox: Vec<NewOutboxEntry>,
}

impl ExecutionCommit {
    /// Start a commit moving `current` to `status`, carrying its other fields forward.
    pub fn transition(current: &Execution, status: ExecutionStatus) -> Self {
        Self {
            execution_id: current.execution_id,
            provider_name: current.provider_name.clone(),
            expected_version: current.expected_version(),
            status,
            payload: current.payload.clone(),
            error: current.error.clone(),
            attempts: current.attempts,
            retry_at: None,
            checkpoints: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_retry_at(mut self, retry_at: Option<DateTime<Utc>>) -> Self {
        self.retry_at = retry_at;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<NewCheckpoint>) -> Self {
        self.checkpoints.extend(checkpoints);
        self
    }

    /// Queue an outbox entry describing the commit as built so far.
    ///
    /// Call after the status, error and attempts are final.
    pub fn emit(mut self, event_type: &str) -> Self {
        let payload = json!({
            "execution_id": self.execution_id,
            "provider_name": self.provider_name,
            "status": self.status,
            "error": self.error,
            "attempts": self.attempts,
        });
        self.outbox.push(NewOutboxEntry {
            event_type: event_type.to_string(),
            payload,
        });
        self
    }
}

/// Selection of executions the retry scheduler may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchQuery {
    /// `WAITING_RETRY` rows whose `retry_at` is at or before this instant.
    pub retry_due_before: DateTime<Utc>,
    /// `PENDING` rows created at or before this instant (their dispatch was lost).
    pub pending_created_before: DateTime<Utc>,
    /// Also return `WAITING_RESUME` rows.
    pub include_suspended: bool,
    pub limit: usize,
}

impl DispatchQuery {
    pub fn matches(&self, execution: &Execution) -> bool {
        match execution.status {
            ExecutionStatus::WaitingRetry => execution
                .retry_at
                .is_none_or(|at| at <= self.retry_due_before),
            ExecutionStatus::Pending => execution.created_at <= self.pending_created_before,
            ExecutionStatus::WaitingResume => self.include_suspended,
            _ => false,
        }
    }
}

/// Transactional persistence for the execution core.
///
/// Implementations must:
/// - enforce uniqueness of `(provider_name, idempotency_key)` at the store level
/// - apply [`ExecutionCommit`]s atomically (all rows or none)
/// - reject commits whose expected version does not match, or whose target row is terminal
/// - reject commits that break the status state machine
/// - never modify or delete checkpoints except through execution deletion
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution. Fails with `UniqueViolation` if the key pair is taken.
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<Execution>, StoreError>;

    async fn find_by_key(
        &self,
        provider_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, StoreError>;

    /// Apply a commit; returns the execution as stored afterwards.
    async fn commit(&self, commit: ExecutionCommit) -> Result<Execution, StoreError>;

    /// All checkpoints for an execution, oldest first.
    async fn checkpoints(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Most recent checkpoint for `step`.
    async fn latest_checkpoint(
        &self,
        execution_id: ExecutionId,
        step: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// All outbox entries for an execution, oldest first.
    async fn outbox_for(&self, execution_id: ExecutionId) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Unprocessed outbox entries, oldest first.
    async fn unprocessed_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Flip `processed` to true. Returns `false` if it already was.
    async fn mark_outbox_processed(&self, id: OutboxEntryId) -> Result<bool, StoreError>;

    async fn list_dispatchable(&self, query: DispatchQuery) -> Result<Vec<Execution>, StoreError>;

    /// `RUNNING` executions last written at or before `updated_before`.
    async fn list_stalled(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Administrative delete; cascades to checkpoints and outbox entries.
    async fn delete_execution(&self, execution_id: ExecutionId) -> Result<bool, StoreError>;
}
