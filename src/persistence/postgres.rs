use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;

use super::storage::{OutboxRepository, StorageError, TransactionalStorage};
use crate::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};

// ============================================================================
// PostgreSQL Storage (sqlx)
// ============================================================================
//
// Transactions are plain sqlx transactions; dropping one unfinished rolls it
// back. Outbox inserts run inside a savepoint so a missing `outbox_events`
// relation does not poison the surrounding business transaction.
//
// ============================================================================

const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id             BIGSERIAL PRIMARY KEY,
    aggregate_id   TEXT        NOT NULL,
    aggregate_type TEXT        NOT NULL,
    event_type     TEXT        NOT NULL,
    payload        JSONB       NOT NULL,
    status         TEXT        NOT NULL DEFAULT 'PENDING',
    retry_count    INTEGER     NOT NULL DEFAULT 0,
    error          TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at   TIMESTAMPTZ
)"#;

const CREATE_OUTBOX_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_outbox_events_status_created
    ON outbox_events (status, created_at)"#;

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("✅ Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_outbox_table(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_OUTBOX_INDEX).execute(&self.pool).await?;
        tracing::info!("Outbox table ready");
        Ok(())
    }
}

#[async_trait]
impl TransactionalStorage for PgStorage {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for PgStorage {
    async fn insert_outbox_event(
        &self,
        tx: &mut Self::Tx,
        event: &NewOutboxEvent,
    ) -> Result<(), StorageError> {
        let mut savepoint = sqlx::Connection::begin(&mut **tx).await?;

        let inserted = sqlx::query(
            "INSERT INTO outbox_events (aggregate_id, aggregate_type, event_type, payload, status) \
             VALUES ($1, $2, $3, $4, 'PENDING')",
        )
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(&event.payload)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => {
                savepoint.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn fetch_outbox_events(
        &self,
        status: OutboxStatus,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, aggregate_id, aggregate_type, event_type, payload, status, \
                    retry_count, error, created_at, processed_at \
             FROM outbox_events \
             WHERE status = $1 AND retry_count < $2 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $3",
        )
        .bind(status.as_str())
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(outbox_event_from_row).collect()
    }

    async fn mark_outbox_processed(&self, id: i64) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'PROCESSED', processed_at = NOW(), error = NULL \
             WHERE id = $1 AND status <> 'PROCESSED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("outbox event {}", id)));
        }
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: i64, reason: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'FAILED', error = $2, retry_count = retry_count + 1 \
             WHERE id = $1 AND status <> 'PROCESSED'",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("outbox event {}", id)));
        }
        Ok(())
    }
}

fn outbox_event_from_row(row: &PgRow) -> Result<OutboxEvent, StorageError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<OutboxStatus>().map_err(StorageError::Other)?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get::<Value, _>("payload")?,
        status,
        retry_count: row.try_get("retry_count")?,
        error: row.try_get("error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        processed_at: row.try_get::<Option<DateTime<Utc>>, _>("processed_at")?,
    })
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        let message = error.to_string();
        match &error {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("40001") => StorageError::Conflict(message),
                Some("40P01") => StorageError::Deadlock(message),
                // query_canceled (statement_timeout), lock_not_available
                Some("57014") | Some("55P03") => StorageError::Timeout(message),
                Some("42P01") => StorageError::MissingRelation(message),
                _ => StorageError::Other(message),
            },
            sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                StorageError::Unavailable(message)
            }
            sqlx::Error::RowNotFound => StorageError::NotFound(message),
            _ => StorageError::Other(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_map_to_storage_errors() {
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolTimedOut),
            StorageError::Timeout(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolClosed),
            StorageError::Unavailable(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::RowNotFound),
            StorageError::NotFound(_)
        ));
    }

    #[test]
    fn test_io_error_is_unavailable_and_not_retried() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = StorageError::from(sqlx::Error::Io(io));

        assert!(matches!(error, StorageError::Unavailable(_)));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        assert!(StorageError::from(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn test_outbox_ddl_mentions_every_column() {
        for column in [
            "aggregate_id",
            "aggregate_type",
            "event_type",
            "payload",
            "status",
            "retry_count",
            "error",
            "created_at",
            "processed_at",
        ] {
            assert!(CREATE_OUTBOX_TABLE.contains(column), "missing {}", column);
        }
    }
}
