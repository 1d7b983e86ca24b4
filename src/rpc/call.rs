use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::errors::CallError;
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Resilient Call - timeout + selective fixed-delay retry
// ============================================================================
//
// Each attempt is bounded by `timeout`. Only errors the classifier marks as
// transient are retried. A timed-out attempt is abandoned, not cancelled on
// the remote side: a late reply is simply dropped.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct CallOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub dependency: String,
    pub operation: String,
}

impl CallOptions {
    pub fn new(dependency: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_retries: 2,
            retry_delay: Duration::from_millis(1000),
            dependency: dependency.into(),
            operation: operation.into(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

pub struct ResilientCall {
    options: CallOptions,
    metrics: Option<Arc<Metrics>>,
}

impl ResilientCall {
    pub fn new(options: CallOptions) -> Self {
        Self {
            options,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. The last error is returned on exhaustion.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let options = &self.options;
        let metrics = self.metrics.as_deref();
        let config = RetryConfig::fixed(options.max_retries, options.retry_delay);
        let label = format!("{}.{}", options.dependency, options.operation);

        retry_on_transient(&config, &label, |attempt| {
            let call = operation();
            async move {
                if attempt > 1 {
                    if let Some(metrics) = metrics {
                        metrics.record_retry_attempt(&options.dependency, &options.operation);
                    }
                }

                tracing::debug!(
                    dependency = %options.dependency,
                    operation = %options.operation,
                    attempt = attempt,
                    "Attempting remote call"
                );

                let started = Instant::now();
                match tokio::time::timeout(options.timeout, call).await {
                    Ok(Ok(value)) => {
                        tracing::debug!(
                            dependency = %options.dependency,
                            operation = %options.operation,
                            attempt = attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Remote call succeeded"
                        );
                        Ok(value)
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(
                            dependency = %options.dependency,
                            operation = %options.operation,
                            attempt = attempt,
                            error = %error,
                            "Remote call failed"
                        );
                        Err(error)
                    }
                    Err(_) => {
                        tracing::warn!(
                            dependency = %options.dependency,
                            operation = %options.operation,
                            attempt = attempt,
                            timeout_ms = options.timeout.as_millis() as u64,
                            "Remote call timed out"
                        );
                        Err(CallError::Timeout(format!(
                            "{} did not answer {} within {}ms",
                            options.dependency,
                            options.operation,
                            options.timeout.as_millis()
                        )))
                    }
                }
            }
        })
        .await
        .into_result()
    }
}

/// Shorthand for a one-off resilient call without metrics
pub async fn resilient_call<F, Fut, T>(options: CallOptions, operation: F) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    ResilientCall::new(options).execute(operation).await
}
