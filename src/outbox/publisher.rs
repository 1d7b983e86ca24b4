use serde_json::Value;
use std::sync::Arc;

use super::event::NewOutboxEvent;
use super::store::{OutboxStore, OutboxWrite};
use crate::messaging::Transport;
use crate::persistence::{OutboxRepository, TransactionError, TransactionRunner, TxFuture};

/// Event emitted straight to the broker, outside any transaction
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub name: String,
    pub payload: Value,
}

impl BrokerEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

// ============================================================================
// Transactional Publisher
// ============================================================================
//
// Two entry points with different delivery guarantees:
//
// - persist_with_outbox: event rows commit with the business write and are
//   delivered later by the outbox dispatcher (at-least-once).
// - persist_then_emit: commit, then emit directly to the broker. A crash or
//   broker failure between the two loses the event.
//
// ============================================================================

pub struct TransactionalPublisher<S: OutboxRepository> {
    runner: TransactionRunner<S>,
    outbox: OutboxStore<S>,
    transport: Arc<dyn Transport>,
}

impl<S: OutboxRepository> TransactionalPublisher<S> {
    pub fn new(
        runner: TransactionRunner<S>,
        outbox: OutboxStore<S>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            runner,
            outbox,
            transport,
        }
    }

    /// Run `unit` and write the events derived from its result into the
    /// outbox, all in one transaction.
    ///
    /// Events that hit a degraded outbox are emitted directly after commit on
    /// a best-effort basis.
    pub async fn persist_with_outbox<T, F, E>(&self, unit: F, events: E) -> Result<T, TransactionError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T> + Send + 'static,
        E: FnOnce(&T) -> Vec<NewOutboxEvent> + Send + 'static,
    {
        let outbox = self.outbox.clone();

        let (value, degraded) = self
            .runner
            .execute(move |tx| {
                Box::pin(async move {
                    let value = unit(&mut *tx).await?;

                    let mut degraded = Vec::new();
                    for event in events(&value) {
                        if outbox.store_event(&mut *tx, &event).await? == OutboxWrite::Degraded {
                            degraded.push(event);
                        }
                    }
                    Ok((value, degraded))
                })
            })
            .await?;

        if !degraded.is_empty() {
            tracing::warn!(
                count = degraded.len(),
                "Outbox degraded, falling back to direct emit after commit"
            );
            for event in degraded {
                self.emit_best_effort(&event.event_type, event.payload).await;
            }
        }

        Ok(value)
    }

    /// Commit `unit`, then emit the events derived from its result directly.
    /// Emit failures are logged and never undo the committed write.
    pub async fn persist_then_emit<T, F, E>(&self, unit: F, events: E) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
        E: FnOnce(&T) -> Vec<BrokerEvent>,
    {
        let value = self.runner.execute(unit).await?;

        for event in events(&value) {
            self.emit_best_effort(&event.name, event.payload).await;
        }

        Ok(value)
    }

    async fn emit_best_effort(&self, name: &str, payload: Value) {
        match self.transport.emit(name, payload).await {
            Ok(()) => tracing::debug!(event = %name, "Event emitted after commit"),
            Err(e) => tracing::error!(
                event = %name,
                error = %e,
                "❌ Event lost: emit after commit failed"
            ),
        }
    }
}
