//! Assembles the worker process from configuration.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use molflow_execution::providers::ToxicologyBatch;
use molflow_execution::{
    ExecutionConfig, ExecutionStore, InMemoryExecutionStore, LoggingConsumer, OutboxRelay,
    PostgresExecutionStore, ProviderRegistry, RelayHandle, RetryScheduler, SchedulerHandle,
    Worker,
};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// A running worker process: the shared [`Worker`] plus its background loops.
#[derive(Debug)]
pub struct App {
    worker: Arc<Worker>,
    scheduler: SchedulerHandle,
    relay: RelayHandle,
}

impl App {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn providers(&self) -> Vec<String> {
        self.worker
            .registry()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Stop the scheduler and the relay, waiting for in-flight ticks.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.relay.shutdown().await;
        info!("background loops stopped");
    }
}

/// Postgres when `database_url` is given (migrations applied), otherwise in-memory.
pub async fn select_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    match database_url {
        Some(url) => {
            let store = PostgresExecutionStore::connect(url, DEFAULT_MAX_CONNECTIONS)
                .await
                .context("failed to connect to Postgres")?;
            store
                .migrate()
                .await
                .context("failed to apply migrations")?;
            info!("using Postgres execution store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; executions will not survive a restart");
            Ok(Arc::new(InMemoryExecutionStore::new()))
        }
    }
}

pub fn registry() -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register(ToxicologyBatch::new())?;
    Ok(registry)
}

/// Build the worker over `store` and spawn its scheduler and outbox relay.
pub fn spawn(store: Arc<dyn ExecutionStore>, config: ExecutionConfig) -> anyhow::Result<App> {
    let relay_config = config.relay.clone();
    info!(mode = ?config.mode, "starting execution worker");

    let worker = Worker::new(store.clone(), registry()?, config);
    let scheduler = RetryScheduler::new(worker.clone()).spawn();
    let relay = OutboxRelay::new(store, Arc::new(LoggingConsumer), relay_config).spawn();

    Ok(App {
        worker,
        scheduler,
        relay,
    })
}

pub async fn start(config: ExecutionConfig, database_url: Option<&str>) -> anyhow::Result<App> {
    let store = select_store(database_url).await?;
    spawn(store, config)
}
