//! Postgres-backed execution store.
//!
//! Every `commit` runs in one transaction: a compare-and-write `UPDATE` on the
//! execution row, followed by the checkpoint and outbox inserts. Either all of
//! them become visible or none do.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation on `executions_provider_key_unique`) | `23505` | `UniqueViolation` | Concurrent `start` with the same key |
//! | Database (other) | Any other | `Storage` | Id collision, constraint or backend failure |
//! | PoolClosed / other | N/A | `Storage` | Connection problems |
//!
//! A compare-and-write that matches no row is explained after the fact by
//! re-reading the row inside the same transaction: missing row is `NotFound`,
//! moved version or terminal status is `Conflict`, anything else is
//! `InvalidTransition`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use molflow_core::{CheckpointId, ExecutionId, OutboxEntryId};

use super::r#trait::{DispatchQuery, ExecutionCommit, ExecutionStore, StoreError};
use crate::model::{Checkpoint, Execution, ExecutionStatus, OutboxEntry};

const PROVIDER_KEY_CONSTRAINT: &str = "executions_provider_key_unique";

const EXECUTION_COLUMNS: &str = r#"
    execution_id,
    idempotency_key,
    provider_name,
    status,
    payload,
    error,
    version,
    attempts,
    retry_at,
    created_at,
    updated_at
"#;

/// Postgres-backed execution store.
///
/// `Send + Sync`; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresExecutionStore {
    pool: Arc<PgPool>,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a compare-and-write matched no row.
    async fn explain_rejection(
        tx: &mut Transaction<'_, Postgres>,
        commit: &ExecutionCommit,
    ) -> Result<StoreError, StoreError> {
        let row = sqlx::query("SELECT status, version FROM executions WHERE execution_id = $1")
            .bind(commit.execution_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("explain_rejection", e))?;

        let Some(row) = row else {
            return Ok(StoreError::NotFound(commit.execution_id));
        };
        let status: String = row
            .try_get("status")
            .map_err(|e| map_sqlx_error("explain_rejection", e))?;
        let status = parse_status(&status)?;
        let version: i64 = row
            .try_get("version")
            .map_err(|e| map_sqlx_error("explain_rejection", e))?;

        if let Err(e) = commit.expected_version.check(version as u64) {
            return Ok(StoreError::Conflict {
                execution_id: commit.execution_id,
                reason: e.to_string(),
            });
        }
        if status.is_terminal() {
            return Ok(StoreError::Conflict {
                execution_id: commit.execution_id,
                reason: format!("execution is already {status}"),
            });
        }
        Ok(StoreError::InvalidTransition {
            from: status,
            to: commit.status,
        })
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(
        skip(self, execution),
        fields(
            execution_id = %execution.execution_id,
            provider_name = %execution.provider_name
        ),
        err
    )]
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id,
                idempotency_key,
                provider_name,
                status,
                payload,
                error,
                version,
                attempts,
                retry_at,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(execution.execution_id.as_uuid())
        .bind(&execution.idempotency_key)
        .bind(&execution.provider_name)
        .bind(execution.status.as_str())
        .bind(&execution.payload)
        .bind(&execution.error)
        .bind(execution.version as i64)
        .bind(execution.attempts as i32)
        .bind(execution.retry_at)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, PROVIDER_KEY_CONSTRAINT) {
                StoreError::UniqueViolation {
                    provider_name: execution.provider_name.clone(),
                    idempotency_key: execution.idempotency_key.clone(),
                }
            } else {
                map_sqlx_error("insert_execution", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(execution_id = %execution_id), err)]
    async fn get(&self, execution_id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = $1"
        ))
        .bind(execution_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_execution", e))?;

        row.as_ref().map(decode_execution).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_key(
        &self,
        provider_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE provider_name = $1 AND idempotency_key = $2"
        ))
        .bind(provider_name)
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_key", e))?;

        row.as_ref().map(decode_execution).transpose()
    }

    #[instrument(
        skip(self, commit),
        fields(
            execution_id = %commit.execution_id,
            status = %commit.status,
            expected_version = commit.expected_version.get(),
            checkpoints = commit.checkpoints.len(),
            outbox = commit.outbox.len()
        ),
        err
    )]
    async fn commit(&self, commit: ExecutionCommit) -> Result<Execution, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sources: Vec<String> = ExecutionStatus::sources_of(commit.status)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE executions
            SET status = $3,
                payload = $4,
                error = $5,
                attempts = $6,
                retry_at = $7,
                version = version + 1,
                updated_at = now()
            WHERE execution_id = $1
              AND version = $2
              AND status = ANY($8)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(commit.execution_id.as_uuid())
        .bind(commit.expected_version.get() as i64)
        .bind(commit.status.as_str())
        .bind(&commit.payload)
        .bind(&commit.error)
        .bind(commit.attempts as i32)
        .bind(commit.retry_at)
        .bind(&sources)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_execution", e))?;

        let Some(row) = row else {
            let rejection = Self::explain_rejection(&mut tx, &commit).await?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(rejection);
        };
        let updated = decode_execution(&row)?;

        let observed_version = commit.expected_version.get() as i64;
        for checkpoint in &commit.checkpoints {
            sqlx::query(
                r#"
                INSERT INTO execution_checkpoints (id, execution_id, step, data, version)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(CheckpointId::new().as_uuid())
            .bind(commit.execution_id.as_uuid())
            .bind(&checkpoint.step)
            .bind(&checkpoint.data)
            .bind(observed_version)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_checkpoint", e))?;
        }

        for entry in &commit.outbox {
            sqlx::query(
                r#"
                INSERT INTO execution_outbox (id, execution_id, event_type, payload)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(OutboxEntryId::new().as_uuid())
            .bind(commit.execution_id.as_uuid())
            .bind(&entry.event_type)
            .bind(&entry.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(updated)
    }

    async fn checkpoints(&self, execution_id: ExecutionId) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, step, data, version, created_at
            FROM execution_checkpoints
            WHERE execution_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(execution_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_checkpoints", e))?;

        rows.iter().map(decode_checkpoint).collect()
    }

    async fn latest_checkpoint(
        &self,
        execution_id: ExecutionId,
        step: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, execution_id, step, data, version, created_at
            FROM execution_checkpoints
            WHERE execution_id = $1 AND step = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id.as_uuid())
        .bind(step)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_checkpoint", e))?;

        row.as_ref().map(decode_checkpoint).transpose()
    }

    async fn outbox_for(&self, execution_id: ExecutionId) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, event_type, payload, processed, created_at
            FROM execution_outbox
            WHERE execution_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(execution_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_for", e))?;

        rows.iter().map(decode_outbox).collect()
    }

    #[instrument(skip(self), err)]
    async fn unprocessed_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, event_type, payload, processed, created_at
            FROM execution_outbox
            WHERE processed = FALSE
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unprocessed_outbox", e))?;

        rows.iter().map(decode_outbox).collect()
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_outbox_processed(&self, id: OutboxEntryId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE execution_outbox
            SET processed = TRUE, processed_at = now()
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_outbox_processed", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM execution_outbox WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_outbox_processed", e))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::Storage(format!("outbox entry not found: {id}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_dispatchable(&self, query: DispatchQuery) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM executions
            WHERE (status = 'WAITING_RETRY' AND (retry_at IS NULL OR retry_at <= $1))
               OR (status = 'PENDING' AND created_at <= $2)
               OR ($3 AND status = 'WAITING_RESUME')
            ORDER BY updated_at ASC
            LIMIT $4
            "#
        ))
        .bind(query.retry_due_before)
        .bind(query.pending_created_before)
        .bind(query.include_suspended)
        .bind(query.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dispatchable", e))?;

        rows.iter().map(decode_execution).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_stalled(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM executions
            WHERE status = 'RUNNING' AND updated_at <= $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stalled", e))?;

        rows.iter().map(decode_execution).collect()
    }

    #[instrument(skip(self), fields(execution_id = %execution_id), err)]
    async fn delete_execution(&self, execution_id: ExecutionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM executions WHERE execution_id = $1")
            .bind(execution_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_execution", e))?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_status(raw: &str) -> Result<ExecutionStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Storage(format!("corrupt status column: {e}")))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            StoreError::Storage(msg)
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some(constraint);
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct ExecutionRow {
    execution_id: uuid::Uuid,
    idempotency_key: String,
    provider_name: String,
    status: String,
    payload: serde_json::Value,
    error: Option<String>,
    version: i64,
    attempts: i32,
    retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ExecutionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ExecutionRow {
            execution_id: row.try_get("execution_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            provider_name: row.try_get("provider_name")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            version: row.try_get("version")?,
            attempts: row.try_get("attempts")?,
            retry_at: row.try_get("retry_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Execution {
            execution_id: ExecutionId::from_uuid(row.execution_id),
            idempotency_key: row.idempotency_key,
            provider_name: row.provider_name,
            status: parse_status(&row.status)?,
            payload: row.payload,
            error: row.error,
            version: row.version as u64,
            attempts: row.attempts as u32,
            retry_at: row.retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_execution(row: &PgRow) -> Result<Execution, StoreError> {
    ExecutionRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize execution row: {e}")))?
        .try_into()
}

#[derive(Debug)]
struct CheckpointRow {
    id: uuid::Uuid,
    execution_id: uuid::Uuid,
    step: String,
    data: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for CheckpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CheckpointRow {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step: row.try_get("step")?,
            data: row.try_get("data")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            id: CheckpointId::from_uuid(row.id),
            execution_id: ExecutionId::from_uuid(row.execution_id),
            step: row.step,
            data: row.data,
            version: row.version as u64,
            created_at: row.created_at,
        }
    }
}

fn decode_checkpoint(row: &PgRow) -> Result<Checkpoint, StoreError> {
    CheckpointRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize checkpoint row: {e}")))
}

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    execution_id: uuid::Uuid,
    event_type: String,
    payload: serde_json::Value,
    processed: bool,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            processed: row.try_get("processed")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxEntry {
    fn from(row: OutboxRow) -> Self {
        OutboxEntry {
            id: OutboxEntryId::from_uuid(row.id),
            execution_id: ExecutionId::from_uuid(row.execution_id),
            event_type: row.event_type,
            payload: row.payload,
            processed: row.processed,
            created_at: row.created_at,
        }
    }
}

fn decode_outbox(row: &PgRow) -> Result<OutboxEntry, StoreError> {
    OutboxRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize outbox row: {e}")))
}
