use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::time::Duration;

use crate::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
use crate::utils::IsTransient;

// ============================================================================
// Storage Capability
// ============================================================================
//
// The storage layer hands out transaction handles with an atomic
// commit/rollback contract. Units of work borrow the handle for the duration
// of one attempt; the runner owns begin/commit/rollback.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization conflict: {0}")]
    Conflict(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Storage timeout: {0}")]
    Timeout(String),

    #[error("Relation does not exist: {0}")]
    MissingRelation(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Conflict, deadlock and lock/statement timeouts clear up on their own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict(_) | StorageError::Deadlock(_) | StorageError::Timeout(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Transaction exceeded {0:?}")]
    Timeout(Duration),

    #[error("Transaction aborted: {0}")]
    Aborted(#[from] anyhow::Error),
}

impl IsTransient for TransactionError {
    fn is_transient(&self) -> bool {
        match self {
            TransactionError::Storage(e) => e.is_retryable(),
            TransactionError::Timeout(_) | TransactionError::Aborted(_) => false,
        }
    }
}

/// Future returned by a unit of work borrowing a transaction for `'t`
pub type TxFuture<'t, T> = BoxFuture<'t, Result<T, TransactionError>>;

#[async_trait]
pub trait TransactionalStorage: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError>;
}

/// Outbox table access. Inserts join the caller's transaction; the
/// dispatcher-side reads and marks run on their own.
#[async_trait]
pub trait OutboxRepository: TransactionalStorage {
    async fn insert_outbox_event(
        &self,
        tx: &mut Self::Tx,
        event: &NewOutboxEvent,
    ) -> Result<(), StorageError>;

    /// Rows in `status` with `retry_count < max_retries`, oldest first
    async fn fetch_outbox_events(
        &self,
        status: OutboxStatus,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StorageError>;

    async fn mark_outbox_processed(&self, id: i64) -> Result<(), StorageError>;

    async fn mark_outbox_failed(&self, id: i64, reason: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_storage_errors() {
        assert!(StorageError::Conflict("40001".into()).is_retryable());
        assert!(StorageError::Deadlock("40P01".into()).is_retryable());
        assert!(StorageError::Timeout("57014".into()).is_retryable());
        assert!(!StorageError::MissingRelation("outbox_events".into()).is_retryable());
        assert!(!StorageError::NotFound("row".into()).is_retryable());
    }

    #[test]
    fn test_transaction_error_transience() {
        let conflict: TransactionError = StorageError::Conflict("x".into()).into();
        assert!(conflict.is_transient());

        let aborted: TransactionError = anyhow::anyhow!("insufficient stock").into();
        assert!(!aborted.is_transient());
        assert_eq!(aborted.to_string(), "Transaction aborted: insufficient stock");

        assert!(!TransactionError::Timeout(Duration::from_millis(10)).is_transient());
    }
}
