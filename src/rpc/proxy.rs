use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::call::{CallOptions, ResilientCall};
use super::errors::{CallError, ServiceError};
use super::translator::translate;
use crate::messaging::Transport;
use crate::metrics::{HealthSource, Metrics};
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

// ============================================================================
// Resilient Service Proxy
// ============================================================================
//
// The call surface business services use instead of the raw transport.
// Per call:
//   readiness guard → circuit breaker → resilient call → breaker bookkeeping
//   → error translation
//
// ============================================================================

/// Timeout, retry and breaker settings shared by a proxy's operations
#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5000),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(1000),
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
        }
    }
}

impl ResilienceConfig {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
        }
    }
}

/// Per-call overrides on top of the proxy's `ResilienceConfig`
#[derive(Clone, Debug, Default)]
pub struct InvokeOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl InvokeOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Single attempt, for calls that must not be repeated
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub dependency: String,
    pub ready: bool,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
}

pub struct ResilientServiceProxy {
    dependency: String,
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    config: ResilienceConfig,
    ready: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl ResilientServiceProxy {
    pub fn new(
        dependency: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: ResilienceConfig,
    ) -> Self {
        let dependency = dependency.into();
        let breaker = CircuitBreaker::new(dependency.clone(), config.breaker_config());

        Self {
            dependency,
            transport,
            breaker,
            config,
            ready: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.breaker = self.breaker.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Connect the transport and mark the proxy ready once its subscriptions
    /// are confirmed. Until then every call fails fast.
    pub async fn connect(&self) -> Result<(), ServiceError> {
        tracing::info!(dependency = %self.dependency, "Connecting service proxy");

        match self.transport.connect().await {
            Ok(()) => {
                self.ready.store(true, Ordering::Release);
                tracing::info!(dependency = %self.dependency, "✅ Service proxy ready");
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    dependency = %self.dependency,
                    error = %error,
                    "Service proxy failed to connect"
                );
                Err(translate(&error))
            }
        }
    }

    /// Invoke a remote operation with typed request and response
    pub async fn invoke<Req, Res>(
        &self,
        operation: &str,
        payload: &Req,
        options: InvokeOptions,
    ) -> Result<Res, ServiceError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(|e| {
            tracing::error!(
                dependency = %self.dependency,
                operation = %operation,
                error = %e,
                "Failed to serialize request payload"
            );
            ServiceError::Internal(format!("Invalid request payload for {}", operation))
        })?;

        let reply = self.invoke_raw(operation, payload, options).await?;

        serde_json::from_value(reply).map_err(|e| {
            tracing::error!(
                dependency = %self.dependency,
                operation = %operation,
                error = %e,
                "Malformed response payload"
            );
            ServiceError::Internal(format!("Malformed response from {}", self.dependency))
        })
    }

    pub async fn invoke_raw(
        &self,
        operation: &str,
        payload: Value,
        options: InvokeOptions,
    ) -> Result<Value, ServiceError> {
        if !self.is_ready() {
            tracing::warn!(
                dependency = %self.dependency,
                operation = %operation,
                "Call rejected, proxy not ready"
            );
            return Err(ServiceError::ServiceUnavailable(format!(
                "{} is not ready",
                self.dependency
            )));
        }

        if !self.breaker.can_execute().await {
            tracing::warn!(
                dependency = %self.dependency,
                operation = %operation,
                circuit_state = %CircuitState::Open,
                "Call rejected by open circuit"
            );
            self.record_outcome(operation, "rejected", Duration::ZERO);
            return Err(translate(&CallError::circuit_open(&self.dependency)));
        }

        let call = ResilientCall::new(self.call_options(operation, &options))
            .with_metrics(self.metrics.clone());
        let transport = &self.transport;
        let started = Instant::now();

        let result = call
            .execute(move || transport.send(operation, payload.clone()))
            .await;

        match result {
            Ok(reply) => {
                self.breaker.record_success().await;
                self.record_outcome(operation, "success", started.elapsed());
                Ok(reply)
            }
            Err(error) => {
                self.breaker.record_failure().await;
                self.record_outcome(operation, "failure", started.elapsed());

                let translated = translate(&error);
                let circuit_state = self.breaker.get_state().await;
                tracing::error!(
                    dependency = %self.dependency,
                    operation = %operation,
                    error = %error,
                    status = translated.status_code(),
                    circuit_state = %circuit_state,
                    "Remote call failed"
                );
                Err(translated)
            }
        }
    }

    pub async fn health(&self) -> DependencyHealth {
        DependencyHealth {
            dependency: self.dependency.clone(),
            ready: self.is_ready(),
            circuit_state: self.breaker.get_state().await,
            failure_count: self.breaker.get_failure_count().await,
        }
    }

    fn call_options(&self, operation: &str, options: &InvokeOptions) -> CallOptions {
        CallOptions::new(self.dependency.clone(), operation)
            .with_timeout(options.timeout.unwrap_or(self.config.request_timeout))
            .with_retries(
                options.max_retries.unwrap_or(self.config.retry_attempts),
                options.retry_delay.unwrap_or(self.config.retry_delay),
            )
    }

    fn record_outcome(&self, operation: &str, outcome: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rpc_call(&self.dependency, operation, outcome, elapsed.as_secs_f64());
        }
    }
}

// ============================================================================
// Proxy Registry - one proxy (and one breaker) per dependency
// ============================================================================

#[derive(Default)]
pub struct ProxyRegistry {
    proxies: HashMap<String, Arc<ResilientServiceProxy>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proxy. A second proxy for the same dependency replaces the first.
    pub fn register(&mut self, proxy: ResilientServiceProxy) -> Arc<ResilientServiceProxy> {
        let proxy = Arc::new(proxy);
        if self
            .proxies
            .insert(proxy.dependency().to_string(), proxy.clone())
            .is_some()
        {
            tracing::warn!(dependency = %proxy.dependency(), "Replaced existing service proxy");
        }
        proxy
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<ResilientServiceProxy>> {
        self.proxies.get(dependency).cloned()
    }

    /// Connect every proxy, reporting the dependencies that failed
    pub async fn connect_all(&self) -> Vec<(String, ServiceError)> {
        let mut failures = Vec::new();
        for (name, proxy) in &self.proxies {
            if let Err(e) = proxy.connect().await {
                failures.push((name.clone(), e));
            }
        }
        failures
    }
}

#[async_trait]
impl HealthSource for ProxyRegistry {
    async fn dependencies(&self) -> Vec<DependencyHealth> {
        let mut report = Vec::with_capacity(self.proxies.len());
        for proxy in self.proxies.values() {
            report.push(proxy.health().await);
        }
        report.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        report
    }
}
