use futures_util::future::{BoxFuture, FutureExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::metrics::Metrics;

// ============================================================================
// Saga Orchestrator
// ============================================================================
//
// Runs steps that cannot share one transaction, each paired with a
// compensation that undoes it:
//
//     [Step 1] → [Step 2] → [Step 3 FAILS]
//                  [Comp 2] → [Comp 1]        (reverse order)
//
// A compensation receives the result of the step it undoes. Compensation
// failures are logged and the remaining compensations still run; the caller
// gets the error of the step that failed. Progress is in memory only, so a
// crash mid-saga is not recovered.
//
// ============================================================================

type ExecuteFn<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;
type CompensateFn<T, E> = Box<dyn FnOnce(T) -> BoxFuture<'static, Result<(), E>> + Send>;

struct SagaStep<T, E> {
    name: String,
    execute: ExecuteFn<T, E>,
    compensate: CompensateFn<T, E>,
}

struct CompletedStep<T, E> {
    name: String,
    result: T,
    compensate: CompensateFn<T, E>,
}

pub struct SagaOrchestrator<T, E> {
    name: String,
    steps: Vec<SagaStep<T, E>>,
    metrics: Option<Arc<Metrics>>,
}

impl<T, E> SagaOrchestrator<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_step<X, XF, C, CF>(self, execute: X, compensate: C) -> Self
    where
        X: FnOnce() -> XF + Send + 'static,
        XF: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(T) -> CF + Send + 'static,
        CF: Future<Output = Result<(), E>> + Send + 'static,
    {
        let name = format!("step-{}", self.steps.len() + 1);
        self.add_named_step(name, execute, compensate)
    }

    pub fn add_named_step<X, XF, C, CF>(mut self, name: impl Into<String>, execute: X, compensate: C) -> Self
    where
        X: FnOnce() -> XF + Send + 'static,
        XF: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(T) -> CF + Send + 'static,
        CF: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            execute: Box::new(move || execute().boxed()),
            compensate: Box::new(move |result| compensate(result).boxed()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order and collect their results.
    pub async fn execute(self) -> Result<Vec<T>, E> {
        let saga_id = Uuid::now_v7();
        let total = self.steps.len();

        tracing::info!(saga_id = %saga_id, saga = %self.name, steps = total, "🚀 Saga started");

        let mut completed: Vec<CompletedStep<T, E>> = Vec::with_capacity(total);

        for SagaStep { name, execute, compensate } in self.steps {
            tracing::debug!(saga_id = %saga_id, step = %name, "Executing saga step");

            match execute().await {
                Ok(result) => completed.push(CompletedStep {
                    name,
                    result,
                    compensate,
                }),
                Err(error) => {
                    tracing::error!(
                        saga_id = %saga_id,
                        saga = %self.name,
                        step = %name,
                        executed_steps = completed.len(),
                        error = %error,
                        "Saga step failed, compensating"
                    );
                    compensate_in_reverse(saga_id, completed, self.metrics.as_deref()).await;
                    return Err(error);
                }
            }
        }

        tracing::info!(saga_id = %saga_id, saga = %self.name, steps = total, "✅ Saga completed");
        Ok(completed.into_iter().map(|step| step.result).collect())
    }
}

async fn compensate_in_reverse<T, E: Display>(
    saga_id: Uuid,
    completed: Vec<CompletedStep<T, E>>,
    metrics: Option<&Metrics>,
) {
    for step in completed.into_iter().rev() {
        let outcome = (step.compensate)(step.result).await;

        match &outcome {
            Ok(()) => {
                tracing::info!(saga_id = %saga_id, step = %step.name, "Step compensated");
            }
            Err(e) => {
                tracing::error!(
                    saga_id = %saga_id,
                    step = %step.name,
                    error = %e,
                    "❌ Compensation failed, continuing with remaining steps"
                );
            }
        }

        if let Some(metrics) = metrics {
            metrics.record_saga_compensation(outcome.is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    #[error("{0}")]
    struct StepError(String);

    type Journal = Arc<Mutex<Vec<String>>>;

    fn record(journal: &Journal, entry: impl Into<String>) {
        journal.lock().unwrap().push(entry.into());
    }

    fn step(
        saga: SagaOrchestrator<String, StepError>,
        journal: &Journal,
        name: &'static str,
        fail: bool,
    ) -> SagaOrchestrator<String, StepError> {
        let on_execute = journal.clone();
        let on_compensate = journal.clone();
        saga.add_named_step(
            name,
            move || async move {
                record(&on_execute, format!("{}.execute", name));
                if fail {
                    Err(StepError(format!("{} failed", name)))
                } else {
                    Ok(format!("{}-result", name))
                }
            },
            move |result| async move {
                record(&on_compensate, format!("{}.compensate({})", name, result));
                Ok(())
            },
        )
    }

    #[tokio::test]
    async fn test_failure_compensates_completed_steps_only() {
        let journal: Journal = Arc::default();
        let mut saga = SagaOrchestrator::new("place-order");
        saga = step(saga, &journal, "A", false);
        saga = step(saga, &journal, "B", true);
        saga = step(saga, &journal, "C", false);

        let result = saga.execute().await;

        assert_eq!(result, Err(StepError("B failed".to_string())));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["A.execute", "B.execute", "A.compensate(A-result)"]
        );
    }

    #[tokio::test]
    async fn test_compensation_runs_in_reverse_and_survives_failures() {
        let journal: Journal = Arc::default();
        let failing = journal.clone();

        let mut saga = SagaOrchestrator::new("register-user");
        saga = step(saga, &journal, "A", false);
        saga = saga.add_named_step(
            "B",
            || async { Ok("B-result".to_string()) },
            move |_| async move {
                record(&failing, "B.compensate");
                Err(StepError("refund service down".into()))
            },
        );
        saga = step(saga, &journal, "C", false);
        saga = step(saga, &journal, "D", true);

        let result = saga.execute().await;

        assert_eq!(result, Err(StepError("D failed".to_string())));
        let entries = journal.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "A.execute",
                "C.execute",
                "D.execute",
                "C.compensate(C-result)",
                "B.compensate",
                "A.compensate(A-result)",
            ]
        );
    }

    #[tokio::test]
    async fn test_success_returns_results_in_order() {
        let journal: Journal = Arc::default();
        let mut saga = SagaOrchestrator::new("happy-path");
        for name in ["A", "B", "C"] {
            saga = step(saga, &journal, name, false);
        }
        assert_eq!(saga.len(), 3);

        let results = saga.execute().await.unwrap();

        assert_eq!(results, vec!["A-result", "B-result", "C-result"]);
        assert!(journal.lock().unwrap().iter().all(|e| e.ends_with(".execute")));
    }

    #[tokio::test]
    async fn test_unnamed_steps_and_metrics() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let saga = SagaOrchestrator::<u32, StepError>::new("numbered")
            .with_metrics(metrics.clone())
            .add_step(|| async { Ok(1) }, |_| async { Ok(()) })
            .add_step(|| async { Err(StepError("boom".into())) }, |_| async { Ok(()) });

        assert!(saga.execute().await.is_err());
        assert_eq!(
            metrics
                .saga_compensations
                .with_label_values(&["compensated"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_saga_succeeds() {
        let saga = SagaOrchestrator::<(), StepError>::new("noop");
        assert!(saga.is_empty());
        assert_eq!(saga.execute().await, Ok(vec![]));
    }
}
