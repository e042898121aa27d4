//! Outbox event types and the at-least-once relay.
//!
//! The worker only ever inserts outbox rows, inside its settlement commits.
//! The relay is the single component that flips `processed`; a crash between
//! delivery and marking re-delivers the entry, so consumers must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::background::{spawn_loop, BackgroundHandle};
use crate::config::RelayConfig;
use crate::model::OutboxEntry;
use crate::store::{ExecutionStore, StoreError};

pub const EXECUTION_SUCCEEDED: &str = "execution.succeeded";
pub const EXECUTION_FAILED: &str = "execution.failed";
pub const EXECUTION_BROKEN: &str = "execution.broken";
pub const EXECUTION_CANCELLED: &str = "execution.cancelled";
pub const EXECUTION_RETRY_SCHEDULED: &str = "execution.retry_scheduled";
pub const EXECUTION_SUSPENDED: &str = "execution.suspended";

pub type RelayHandle = BackgroundHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Downstream receiver of outbox entries (webhooks, notifications, ...).
#[async_trait]
pub trait OutboxConsumer: Send + Sync + 'static {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<(), DeliveryError>;
}

/// Consumer that records each entry as a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingConsumer;

#[async_trait]
impl OutboxConsumer for LoggingConsumer {
    async fn deliver(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        info!(
            outbox_id = %entry.id,
            execution_id = %entry.execution_id,
            event_type = %entry.event_type,
            payload = %entry.payload,
            "outbox event"
        );
        Ok(())
    }
}

/// Result of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// Entries already marked by a concurrent relay.
    pub skipped: usize,
    pub failed: Option<String>,
}

pub struct OutboxRelay {
    store: Arc<dyn ExecutionStore>,
    consumer: Arc<dyn OutboxConsumer>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        consumer: Arc<dyn OutboxConsumer>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            consumer,
            config,
        }
    }

    /// Deliver unprocessed entries oldest-first.
    ///
    /// The pass stops at the first delivery failure so no later entry is
    /// delivered ahead of it; the failed entry stays unprocessed.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let entries = self.store.unprocessed_outbox(self.config.batch_size).await?;
        let mut report = DrainReport::default();

        for entry in entries {
            if let Err(e) = self.consumer.deliver(&entry).await {
                warn!(
                    outbox_id = %entry.id,
                    execution_id = %entry.execution_id,
                    event_type = %entry.event_type,
                    error = %e,
                    "outbox delivery failed; will retry"
                );
                report.failed = Some(e.to_string());
                break;
            }

            if self.store.mark_outbox_processed(entry.id).await? {
                report.delivered += 1;
            } else {
                debug!(outbox_id = %entry.id, "outbox entry already processed");
                report.skipped += 1;
            }
        }

        Ok(report)
    }

    pub fn spawn(self) -> RelayHandle {
        let interval = self.config.poll_interval;
        let relay = Arc::new(self);
        spawn_loop("outbox-relay", interval, move || {
            let relay = relay.clone();
            async move {
                match relay.drain_once().await {
                    Ok(report) if report.delivered > 0 => {
                        debug!(delivered = report.delivered, "outbox relay pass");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "outbox relay pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Execution, ExecutionStatus};
    use crate::store::{ExecutionCommit, InMemoryExecutionStore};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records deliveries; fails on the `fail_at`-th call.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl OutboxConsumer for Recording {
        async fn deliver(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
            let mut seen = self.seen.lock().unwrap();
            if self.fail_at == Some(seen.len()) {
                return Err(DeliveryError("webhook unavailable".to_string()));
            }
            seen.push(entry.event_type.clone());
            Ok(())
        }
    }

    async fn cancelled_executions(store: &InMemoryExecutionStore, n: usize) {
        for i in 0..n {
            let execution = Execution::new("p", format!("k{i}"), json!({}));
            store.insert(&execution).await.unwrap();
            store
                .commit(
                    ExecutionCommit::transition(&execution, ExecutionStatus::Cancelled)
                        .emit(EXECUTION_CANCELLED),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn drain_delivers_and_marks_each_entry() {
        let store = Arc::new(InMemoryExecutionStore::new());
        cancelled_executions(&store, 3).await;
        let consumer = Arc::new(Recording::default());
        let relay = OutboxRelay::new(store.clone(), consumer.clone(), RelayConfig::default());

        let report = relay.drain_once().await.unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(consumer.seen.lock().unwrap().len(), 3);
        assert!(store.unprocessed_outbox(10).await.unwrap().is_empty());

        let again = relay.drain_once().await.unwrap();
        assert_eq!(again, DrainReport::default());
    }

    #[tokio::test]
    async fn drain_stops_at_first_failure() {
        let store = Arc::new(InMemoryExecutionStore::new());
        cancelled_executions(&store, 3).await;
        let consumer = Arc::new(Recording {
            fail_at: Some(1),
            ..Default::default()
        });
        let relay = OutboxRelay::new(store.clone(), consumer, RelayConfig::default());

        let report = relay.drain_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(report.failed.is_some());
        assert_eq!(store.unprocessed_outbox(10).await.unwrap().len(), 2);
    }
}
