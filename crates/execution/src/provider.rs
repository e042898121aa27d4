//! Provider adapter contract.
//!
//! A provider couples a [`UnitOfWork`] (the domain computation) with the
//! execution core. Callers only ever see [`Provider::start`] and
//! [`Provider::status`]; every mutation after creation goes through the worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use molflow_core::ExecutionId;

use crate::checkpoint::CheckpointAccessor;
use crate::config::ExecutionMode;
use crate::error::ExecutionError;
use crate::idempotency::IdempotencyGuard;
use crate::model::ExecutionMeta;
use crate::worker::Worker;

/// A `start` payload the provider cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid payload: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, crashed tool, temporary unavailability
    Transient,
    /// Input the provider can never process
    Permanent,
}

/// Execution-wide failure of a unit of work.
///
/// Per-item failures inside a batch belong in the item's result slot instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} failure: {message}")]
pub struct WorkError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WorkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Successful end of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// All work done; the value is the final payload.
    Completed(JsonValue),
    /// Progress checkpointed; the value is the payload so far.
    Suspended(JsonValue),
}

/// The domain computation a provider runs.
#[async_trait]
pub trait UnitOfWork: Send + Sync + 'static {
    /// Provider name; also the `provider_name` of its executions.
    fn name(&self) -> &str;

    /// Structural check run before any store write.
    fn validate(&self, payload: &JsonValue) -> Result<(), ValidationError>;

    /// Run one attempt.
    ///
    /// `payload` is the stored payload, including results from earlier
    /// attempts. Progress recorded on `checkpoints` is committed with the
    /// attempt's outcome.
    async fn execute(
        &self,
        payload: JsonValue,
        checkpoints: &mut CheckpointAccessor,
    ) -> Result<WorkOutcome, WorkError>;
}

/// Caller-facing handle for one registered unit of work.
#[derive(Clone)]
pub struct Provider {
    unit: Arc<dyn UnitOfWork>,
    worker: Arc<Worker>,
    guard: IdempotencyGuard,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.unit.name())
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub(crate) fn new(unit: Arc<dyn UnitOfWork>, worker: Arc<Worker>) -> Self {
        let guard = IdempotencyGuard::new(worker.store());
        Self {
            unit,
            worker,
            guard,
        }
    }

    pub fn name(&self) -> &str {
        self.unit.name()
    }

    /// Create (or find) the execution for `idempotency_key` and trigger it.
    ///
    /// A duplicate key returns the existing execution unchanged and does not
    /// trigger it again; the submitted payload is ignored.
    pub async fn start(
        &self,
        payload: JsonValue,
        idempotency_key: &str,
    ) -> Result<ExecutionMeta, ExecutionError> {
        let (execution, created) = self
            .guard
            .obtain_or_create(self.unit.as_ref(), idempotency_key, payload)
            .await?;

        if !created {
            debug!(
                execution_id = %execution.execution_id,
                provider = %execution.provider_name,
                status = %execution.status,
                "idempotent start returned existing execution"
            );
            return Ok(execution.meta());
        }

        match self.worker.config().mode {
            ExecutionMode::Inline => self.worker.run(execution.execution_id).await,
            ExecutionMode::Dispatched => {
                drop(self.worker.dispatch(execution.execution_id));
                Ok(execution.meta())
            }
        }
    }

    /// Latest committed state. Never waits on in-flight work.
    pub async fn status(&self, execution_id: ExecutionId) -> Result<ExecutionMeta, ExecutionError> {
        let meta = self.worker.status(execution_id).await?;
        if meta.provider_name != self.unit.name() {
            return Err(ExecutionError::NotFound(execution_id));
        }
        Ok(meta)
    }
}
