use std::sync::Arc;

use super::event::{NewOutboxEvent, OutboxEvent, OutboxStatus, MAX_OUTBOX_RETRIES};
use crate::metrics::Metrics;
use crate::persistence::{OutboxRepository, StorageError};

/// Outcome of writing an outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxWrite {
    /// Row is part of the caller's transaction
    Stored,
    /// Outbox relation unavailable; the event is NOT persisted
    Degraded,
}

// ============================================================================
// Outbox Store
// ============================================================================
//
// Writes event rows with the caller's open transaction so they commit
// together with the business change. Dispatch is someone else's job: a
// dispatcher polls `get_pending_events` / `get_failed_events`, publishes,
// and marks each row.
//
// ============================================================================

pub struct OutboxStore<S: OutboxRepository> {
    storage: Arc<S>,
    metrics: Option<Arc<Metrics>>,
}

impl<S: OutboxRepository> Clone for OutboxStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: OutboxRepository> OutboxStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Insert a PENDING row using the caller's transaction.
    ///
    /// A missing outbox relation degrades to a warning and `Degraded`; the
    /// business transaction carries on without the event row. Any other
    /// storage error is returned and should abort the transaction.
    pub async fn store_event(
        &self,
        tx: &mut S::Tx,
        event: &NewOutboxEvent,
    ) -> Result<OutboxWrite, StorageError> {
        match self.storage.insert_outbox_event(tx, event).await {
            Ok(()) => {
                tracing::debug!(
                    aggregate_type = %event.aggregate_type,
                    aggregate_id = %event.aggregate_id,
                    event_type = %event.event_type,
                    "Outbox event staged"
                );
                self.record(&event.event_type, false);
                Ok(OutboxWrite::Stored)
            }
            Err(StorageError::MissingRelation(reason)) => {
                tracing::warn!(
                    aggregate_type = %event.aggregate_type,
                    aggregate_id = %event.aggregate_id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "⚠️ Outbox unavailable, event not persisted (degraded mode)"
                );
                self.record(&event.event_type, true);
                Ok(OutboxWrite::Degraded)
            }
            Err(e) => Err(e),
        }
    }

    /// PENDING rows under the retry cap, oldest first
    pub async fn get_pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StorageError> {
        self.storage
            .fetch_outbox_events(OutboxStatus::Pending, MAX_OUTBOX_RETRIES, limit)
            .await
    }

    /// FAILED rows that still have retries left, oldest first
    pub async fn get_failed_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StorageError> {
        self.storage
            .fetch_outbox_events(OutboxStatus::Failed, MAX_OUTBOX_RETRIES, limit)
            .await
    }

    pub async fn mark_as_processed(&self, event_id: i64) -> Result<(), StorageError> {
        self.storage.mark_outbox_processed(event_id).await?;
        tracing::debug!(event_id = event_id, "Outbox event processed");
        Ok(())
    }

    pub async fn mark_as_failed(&self, event_id: i64, reason: &str) -> Result<(), StorageError> {
        self.storage.mark_outbox_failed(event_id, reason).await?;
        tracing::warn!(event_id = event_id, reason = %reason, "Outbox event failed");
        Ok(())
    }

    fn record(&self, event_type: &str, degraded: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_outbox_write(event_type, degraded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryStorage, TransactionRunner};
    use serde_json::json;
    use std::time::Duration;

    fn setup(storage: InMemoryStorage) -> (TransactionRunner<InMemoryStorage>, OutboxStore<InMemoryStorage>) {
        let storage = Arc::new(storage);
        (TransactionRunner::new(storage.clone()), OutboxStore::new(storage))
    }

    async fn store_committed(
        runner: &TransactionRunner<InMemoryStorage>,
        outbox: &OutboxStore<InMemoryStorage>,
        aggregate_id: &str,
    ) -> OutboxWrite {
        let outbox = outbox.clone();
        let event = NewOutboxEvent::new("Order", aggregate_id, "OrderCreated", json!({"id": aggregate_id}));
        runner
            .execute(move |tx| {
                Box::pin(async move {
                    tx.put(format!("order:{}", event.aggregate_id), event.payload.clone());
                    Ok(outbox.store_event(tx, &event).await?)
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_fetch_and_mark_processed() {
        let (runner, outbox) = setup(InMemoryStorage::new());

        assert_eq!(store_committed(&runner, &outbox, "o-1").await, OutboxWrite::Stored);

        let pending = outbox.get_pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OutboxStatus::Pending);
        assert_eq!(pending[0].retry_count, 0);

        outbox.mark_as_processed(pending[0].id).await.unwrap();

        assert!(outbox.get_pending_events(10).await.unwrap().is_empty());
        let row = &runner.storage().outbox_rows().await[0];
        assert_eq!(row.status, OutboxStatus::Processed);
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_row() {
        let (runner, outbox) = setup(InMemoryStorage::new());
        let store = outbox.clone();

        let result: Result<(), _> = runner
            .execute(move |tx| {
                Box::pin(async move {
                    let event = NewOutboxEvent::new("Order", "o-1", "OrderCreated", json!({}));
                    store.store_event(tx, &event).await?;
                    Err(anyhow::anyhow!("payment declined").into())
                })
            })
            .await;

        assert!(result.is_err());
        assert!(outbox.get_pending_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_events_oldest_first_and_limited() {
        let (runner, outbox) = setup(InMemoryStorage::new());

        for id in ["o-1", "o-2", "o-3"] {
            store_committed(&runner, &outbox, id).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let pending = outbox.get_pending_events(2).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|e| e.aggregate_id.as_str()).collect();
        assert_eq!(ids, vec!["o-1", "o-2"]);
    }

    #[tokio::test]
    async fn test_failed_events_respect_retry_cap() {
        let (runner, outbox) = setup(InMemoryStorage::new());
        store_committed(&runner, &outbox, "o-1").await;
        let id = outbox.get_pending_events(1).await.unwrap()[0].id;

        outbox.mark_as_failed(id, "broker timeout").await.unwrap();

        assert!(outbox.get_pending_events(10).await.unwrap().is_empty());
        let failed = outbox.get_failed_events(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].error.as_deref(), Some("broker timeout"));

        for _ in 0..4 {
            outbox.mark_as_failed(id, "broker timeout").await.unwrap();
        }
        assert!(outbox.get_failed_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processed_event_cannot_be_marked_again() {
        let (runner, outbox) = setup(InMemoryStorage::new());
        store_committed(&runner, &outbox, "o-1").await;
        let id = outbox.get_pending_events(1).await.unwrap()[0].id;

        outbox.mark_as_processed(id).await.unwrap();

        assert!(matches!(outbox.mark_as_processed(id).await, Err(StorageError::NotFound(_))));
        assert!(matches!(outbox.mark_as_failed(id, "late").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_outbox_degrades_without_failing_business_write() {
        let (runner, outbox) = setup(InMemoryStorage::without_outbox_table());

        assert_eq!(store_committed(&runner, &outbox, "o-1").await, OutboxWrite::Degraded);
        assert_eq!(runner.storage().get("order:o-1").await, Some(json!({"id": "o-1"})));
    }
}
