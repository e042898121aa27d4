//! Retry scheduler and stalled-run reaper.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use super::executor::Worker;
use crate::background::{spawn_loop, BackgroundHandle};
use crate::config::ExecutionMode;
use crate::error::ExecutionError;
use crate::model::ExecutionStatus;
use crate::store::DispatchQuery;

pub type SchedulerHandle = BackgroundHandle;

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stalled `RUNNING` executions moved to `WAITING_RETRY` or `BROKEN`
    pub reaped: usize,
    /// Executions handed to the worker
    pub dispatched: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Re-dispatches due retries, lost dispatches and suspended executions, and
/// reaps runs whose worker disappeared.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    worker: Arc<Worker>,
}

impl RetryScheduler {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// One pass: reap stalled runs, then dispatch due executions.
    ///
    /// In inline mode each dispatch runs to settlement before the next; in
    /// dispatched mode they are spawned and the tick returns immediately.
    pub async fn tick(&self) -> Result<TickReport, ExecutionError> {
        let config = &self.worker.config().scheduler;
        let store = self.worker.store();
        let now = Utc::now();
        let mut report = TickReport::default();

        let lease = ChronoDuration::from_std(config.running_lease).unwrap_or(ChronoDuration::MAX);
        let stalled_before = now.checked_sub_signed(lease).unwrap_or(now);
        for stalled in store.list_stalled(stalled_before, config.batch_size).await? {
            match self.worker.reap(&stalled).await {
                Ok(meta)
                    if matches!(
                        meta.status,
                        ExecutionStatus::WaitingRetry | ExecutionStatus::Broken
                    ) =>
                {
                    report.reaped += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(execution_id = %stalled.execution_id, error = %e, "reap failed");
                    report.errors += 1;
                }
            }
        }

        let grace = ChronoDuration::from_std(config.pending_grace).unwrap_or(ChronoDuration::MAX);
        let query = DispatchQuery {
            retry_due_before: now,
            pending_created_before: now.checked_sub_signed(grace).unwrap_or(now),
            include_suspended: config.resume_suspended,
            limit: config.batch_size,
        };
        for execution in store.list_dispatchable(query).await? {
            let execution_id = execution.execution_id;
            debug!(
                execution_id = %execution_id,
                status = %execution.status,
                "scheduler dispatching execution"
            );
            match self.worker.config().mode {
                ExecutionMode::Inline => match self.worker.run(execution_id).await {
                    Ok(_) => report.dispatched += 1,
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "scheduled run failed");
                        report.errors += 1;
                    }
                },
                ExecutionMode::Dispatched => {
                    drop(self.worker.dispatch(execution_id));
                    report.dispatched += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run `tick` every `scheduler.poll_interval` until shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let interval = self.worker.config().scheduler.poll_interval;
        let scheduler = Arc::new(self);
        spawn_loop("retry-scheduler", interval, move || {
            let scheduler = scheduler.clone();
            async move {
                match scheduler.tick().await {
                    Ok(report) if !report.is_idle() => {
                        debug!(
                            reaped = report.reaped,
                            dispatched = report.dispatched,
                            errors = report.errors,
                            "scheduler tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "scheduler tick failed"),
                }
            }
        })
    }
}
