//! `molflow-core`: identifiers and concurrency primitives shared by the execution core.
//!
//! This crate contains **pure** building blocks (no IO, no runtime).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{CheckpointId, ExecutionId, OutboxEntryId};
pub use version::ExpectedVersion;
