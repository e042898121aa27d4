//! Job worker, retry policy and the scheduling loop.
//!
//! - [`Worker`]: claims an execution, runs its unit of work, commits the outcome
//! - [`RetryPolicy`] / [`decide`]: pure mapping from attempt outcome to next status
//! - [`RetryScheduler`]: re-dispatches due work and reaps stalled runs

mod executor;
mod policy;
mod scheduler;

pub use executor::Worker;
pub use policy::{decide, BackoffStrategy, OutcomeKind, RetryPolicy, Settlement};
pub use scheduler::{RetryScheduler, SchedulerHandle, TickReport};
