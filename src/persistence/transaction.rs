use futures_util::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::storage::{TransactionError, TransactionalStorage, TxFuture};
use crate::metrics::Metrics;
use crate::utils::{IsTransient, RetryConfig};

// ============================================================================
// Transaction Runner
// ============================================================================
//
// Every write path goes through here instead of touching storage directly.
// A unit of work is a closure that borrows the transaction handle and
// returns a boxed future:
//
//     runner.execute(|tx| Box::pin(async move {
//         tx.put("order:1", json!({"total": 10}));
//         Ok(())
//     })).await?;
//
// Ok commits, Err rolls back. Partial writes are never undone by hand; the
// storage layer's rollback takes care of them.
//
// ============================================================================

/// Prepared operation for `execute_batch`
pub type BatchOp<S> =
    Box<dyn for<'t> FnOnce(&'t mut <S as TransactionalStorage>::Tx) -> TxFuture<'t, ()> + Send>;

/// Independent operation for `execute_parallel`; locks the shared handle for
/// each storage access
pub type ParallelOp<S, T> = Box<
    dyn for<'t> FnOnce(&'t Mutex<<S as TransactionalStorage>::Tx>) -> TxFuture<'t, T> + Send,
>;

pub fn batch_op<S, F>(op: F) -> BatchOp<S>
where
    S: TransactionalStorage,
    F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, ()> + Send + 'static,
{
    Box::new(op)
}

pub fn parallel_op<S, T, F>(op: F) -> ParallelOp<S, T>
where
    S: TransactionalStorage,
    F: for<'t> FnOnce(&'t Mutex<S::Tx>) -> TxFuture<'t, T> + Send + 'static,
{
    Box::new(op)
}

pub struct TransactionRunner<S: TransactionalStorage> {
    storage: Arc<S>,
    metrics: Option<Arc<Metrics>>,
}

impl<S: TransactionalStorage> Clone for TransactionRunner<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: TransactionalStorage> TransactionRunner<S> {
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

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Run `unit` in one transaction
    pub async fn execute<T, F>(&self, unit: F) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
    {
        let mut tx = self.storage.begin().await?;

        match unit(&mut tx).await {
            Ok(value) => {
                self.storage.commit(tx).await?;
                Ok(value)
            }
            Err(error) => {
                tracing::debug!(error = %error, "Unit of work failed, rolling back");
                if let Err(rollback_error) = self.storage.rollback(tx).await {
                    tracing::warn!(error = %rollback_error, "Rollback failed");
                }
                Err(error)
            }
        }
    }

    /// Like `execute`, bounded by `timeout` of wall-clock time. The abandoned
    /// transaction is dropped, which rolls it back.
    pub async fn execute_with_timeout<T, F>(
        &self,
        unit: F,
        timeout: Duration,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
    {
        match tokio::time::timeout(timeout, self.execute(unit)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Transaction timed out");
                Err(TransactionError::Timeout(timeout))
            }
        }
    }

    /// Re-run the whole unit on conflict, deadlock or storage timeout.
    /// The delay before retry `k` is `base_delay * k`.
    pub async fn execute_with_retry<T, F>(
        &self,
        mut unit: F,
        retries: u32,
        base_delay: Duration,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut S::Tx) -> TxFuture<'t, T> + Send,
    {
        let config = RetryConfig::linear(retries, base_delay);
        let mut retry = 0;

        loop {
            match self.execute(&mut unit).await {
                Ok(value) => {
                    if retry > 0 {
                        tracing::info!(retries = retry, "Transaction succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_transient() && retry < config.max_retries => {
                    retry += 1;
                    let delay = config.backoff.delay_for_retry(retry);

                    tracing::warn!(
                        retry = retry,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient storage error, retrying transaction"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_transaction_retry();
                    }

                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    if error.is_transient() {
                        tracing::error!(
                            retries = retry,
                            error = %error,
                            "Transaction retries exhausted"
                        );
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Run independent operations concurrently inside one transaction.
    /// All must succeed for the transaction to commit; results keep input order.
    pub async fn execute_parallel<T>(
        &self,
        operations: Vec<ParallelOp<S, T>>,
    ) -> Result<Vec<T>, TransactionError>
    where
        T: Send,
    {
        let shared = Mutex::new(self.storage.begin().await?);

        let outcome = {
            let handle = &shared;
            try_join_all(operations.into_iter().map(|op| op(handle))).await
        };

        let tx = shared.into_inner();
        match outcome {
            Ok(values) => {
                self.storage.commit(tx).await?;
                Ok(values)
            }
            Err(error) => {
                tracing::debug!(error = %error, "Parallel operation failed, rolling back");
                if let Err(rollback_error) = self.storage.rollback(tx).await {
                    tracing::warn!(error = %rollback_error, "Rollback failed");
                }
                Err(error)
            }
        }
    }

    /// Apply prepared operations in order as one atomic batch.
    /// Returns how many operations were applied.
    pub async fn execute_batch(&self, operations: Vec<BatchOp<S>>) -> Result<usize, TransactionError> {
        let count = operations.len();
        self.execute(move |tx| {
            Box::pin(async move {
                for op in operations {
                    op(&mut *tx).await?;
                }
                Ok(count)
            })
        })
        .await
    }
}
