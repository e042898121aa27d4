//! `molflow-execution`: durable execution core for external computations.
//!
//! ## Components
//!
//! - [`ExecutionStore`]: transactional persistence (in-memory and Postgres)
//! - [`IdempotencyGuard`]: one execution per `(provider_name, idempotency_key)`
//! - [`CheckpointManager`]: append-only progress markers for resume
//! - [`Worker`]: claim, run, settle; all writes compare-and-write on `version`
//! - [`RetryScheduler`]: re-dispatches due work and reaps stalled runs
//! - [`OutboxRelay`]: at-least-once delivery of events committed with state changes
//! - [`Provider`]: the caller-facing `start` / `status` surface
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use molflow_execution::providers::ToxicologyBatch;
//! use molflow_execution::{ExecutionConfig, InMemoryExecutionStore, ProviderRegistry, Worker};
//!
//! # async fn demo() -> Result<(), molflow_execution::ExecutionError> {
//! let mut registry = ProviderRegistry::new();
//! registry.register(ToxicologyBatch::new())?;
//!
//! let worker = Worker::new(
//!     Arc::new(InMemoryExecutionStore::new()),
//!     registry,
//!     ExecutionConfig::inline(),
//! );
//! let provider = worker.provider("toxicology-batch")?;
//!
//! let meta = provider
//!     .start(serde_json::json!({"smiles_list": ["CCO"]}), "request-1")
//!     .await?;
//! let status = provider.status(meta.execution_id).await?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod model;
pub mod outbox;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod store;
pub mod worker;

pub use background::BackgroundHandle;
pub use checkpoint::{CheckpointAccessor, CheckpointManager};
pub use config::{ConfigError, ExecutionConfig, ExecutionMode, RelayConfig, SchedulerConfig};
pub use error::ExecutionError;
pub use idempotency::IdempotencyGuard;
pub use model::{
    Checkpoint, Execution, ExecutionMeta, ExecutionStatus, NewCheckpoint, NewOutboxEntry,
    OutboxEntry,
};
pub use outbox::{
    DeliveryError, DrainReport, LoggingConsumer, OutboxConsumer, OutboxRelay, RelayHandle,
};
pub use provider::{ErrorKind, Provider, UnitOfWork, ValidationError, WorkError, WorkOutcome};
pub use registry::ProviderRegistry;
pub use store::{
    DispatchQuery, ExecutionCommit, ExecutionStore, InMemoryExecutionStore,
    PostgresExecutionStore, StoreError,
};
pub use worker::{
    decide, BackoffStrategy, OutcomeKind, RetryPolicy, RetryScheduler, SchedulerHandle,
    Settlement, TickReport, Worker,
};

pub use molflow_core::{CheckpointId, ExecutionId, OutboxEntryId};
