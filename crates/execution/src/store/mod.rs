//! Execution store boundary.
//!
//! The store is the only shared mutable resource of the execution core. It
//! persists executions, checkpoints and outbox entries and applies every
//! execution write as a single compare-and-write commit.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use r#trait::{DispatchQuery, ExecutionCommit, ExecutionStore, StoreError};
