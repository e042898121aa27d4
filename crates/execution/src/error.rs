//! Caller-facing error for the execution core.

use thiserror::Error;

use molflow_core::ExecutionId;

use crate::provider::ValidationError;
use crate::store::StoreError;

/// Error surfaced by providers, the worker and the scheduler.
///
/// Version conflicts and idempotency races are resolved internally and do not
/// reach callers as failures of the logical operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("execution not found: {0}")]
    NotFound(ExecutionId),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider already registered: {0}")]
    DuplicateProvider(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}
