use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::storage::{OutboxRepository, StorageError, TransactionalStorage};
use crate::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};

// ============================================================================
// In-Memory Storage
// ============================================================================
//
// Key/value records plus outbox rows. A transaction stages its writes and
// applies them all at commit; rollback or drop discards them. Used when no
// database is configured and throughout the test suite.
//
// ============================================================================

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, Value>,
    outbox: Vec<OutboxEvent>,
    next_outbox_id: i64,
}

pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    outbox_table: bool,
    failing_commits: AtomicU32,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            outbox_table: true,
            failing_commits: AtomicU32::new(0),
        }
    }

    /// Storage whose outbox relation is absent
    pub fn without_outbox_table() -> Self {
        Self {
            outbox_table: false,
            ..Self::new()
        }
    }

    /// The next `count` commits fail with a serialization conflict
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Committed value for `key`
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.records.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct StagedOutboxEvent {
    event: NewOutboxEvent,
    created_at: DateTime<Utc>,
}

pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    writes: HashMap<String, Value>,
    outbox: Vec<StagedOutboxEvent>,
}

impl MemoryTx {
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.writes.insert(key.into(), value);
    }

    /// Reads this transaction's own writes first, then committed state
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.writes.get(key) {
            return Some(value.clone());
        }
        self.state.lock().await.records.get(key).cloned()
    }
}

#[async_trait]
impl TransactionalStorage for InMemoryStorage {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StorageError> {
        Ok(MemoryTx {
            state: self.state.clone(),
            writes: HashMap::new(),
            outbox: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::Conflict(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        state.records.extend(tx.writes);

        for staged in tx.outbox {
            state.next_outbox_id += 1;
            let id = state.next_outbox_id;
            state.outbox.push(OutboxEvent {
                id,
                aggregate_id: staged.event.aggregate_id,
                aggregate_type: staged.event.aggregate_type,
                event_type: staged.event.event_type,
                payload: staged.event.payload,
                status: OutboxStatus::Pending,
                retry_count: 0,
                error: None,
                created_at: staged.created_at,
                processed_at: None,
            });
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), StorageError> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for InMemoryStorage {
    async fn insert_outbox_event(
        &self,
        tx: &mut MemoryTx,
        event: &NewOutboxEvent,
    ) -> Result<(), StorageError> {
        if !self.outbox_table {
            return Err(StorageError::MissingRelation("outbox_events".to_string()));
        }
        tx.outbox.push(StagedOutboxEvent {
            event: event.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn fetch_outbox_events(
        &self,
        status: OutboxStatus,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        if !self.outbox_table {
            return Err(StorageError::MissingRelation("outbox_events".to_string()));
        }
        let state = self.state.lock().await;
        let mut rows: Vec<OutboxEvent> = state
            .outbox
            .iter()
            .filter(|e| e.status == status && e.retry_count < max_retries)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_outbox_processed(&self, id: i64) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let row = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id && e.status != OutboxStatus::Processed)
            .ok_or_else(|| StorageError::NotFound(format!("outbox event {}", id)))?;

        row.status = OutboxStatus::Processed;
        row.processed_at = Some(Utc::now());
        row.error = None;
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: i64, reason: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let row = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id && e.status != OutboxStatus::Processed)
            .ok_or_else(|| StorageError::NotFound(format!("outbox event {}", id)))?;

        row.status = OutboxStatus::Failed;
        row.error = Some(reason.to_string());
        row.retry_count += 1;
        Ok(())
    }
}
