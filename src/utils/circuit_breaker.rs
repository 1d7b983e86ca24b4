use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::metrics::Metrics;

// ============================================================================
// Circuit Breaker Pattern Implementation
// ============================================================================
//
// Tracks consecutive failures of one dependency and short-circuits calls while
// the dependency looks unhealthy.
//
// States:
// - Closed: Normal operation, requests pass through
// - Open: Too many failures, requests blocked immediately
// - HalfOpen: Reset timeout elapsed, the next call goes through as a probe
//
// State is process-local. Each replica decides on its own.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding (0=Closed, 1=Open, 2=HalfOpen)
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    dependency: Arc<str>,
    state: Arc<Mutex<CircuitBreakerState>>,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: Arc::from(dependency.into()),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
            })),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.update_circuit_breaker_state(&self.dependency, CircuitState::Closed);
        self.metrics = Some(metrics);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Whether a call may be attempted now.
    ///
    /// An open circuit whose reset timeout has elapsed moves to HalfOpen and
    /// lets this call through as the probe. Concurrent probes are not
    /// deduplicated.
    pub async fn can_execute(&self) -> bool {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure_time
                    .map(|last| last.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if cooled_down {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Closed);
                state.failure_count = 0;
                state.last_failure_time = None;
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {
                tracing::warn!(
                    dependency = %self.dependency,
                    "Success recorded while circuit is open"
                );
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;

        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        dependency = %self.dependency,
                        failure_count = state.failure_count,
                        "Circuit breaker opening after consecutive failures"
                    );
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    dependency = %self.dependency,
                    "Probe failed during half-open, reopening circuit"
                );
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {
                // Already open, the timestamp refresh extends the cooldown
            }
        }
    }

    /// Manually reset the circuit breaker
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        tracing::info!(dependency = %self.dependency, "Circuit breaker manually reset");
        self.transition(&mut state, CircuitState::Closed);
        state.failure_count = 0;
        state.last_failure_time = None;
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn get_failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    pub async fn last_failure_time(&self) -> Option<Instant> {
        self.state.lock().await.last_failure_time
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;

        tracing::info!(
            dependency = %self.dependency,
            from_state = %from,
            to_state = %to,
            "Circuit breaker state transition"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_transition(&self.dependency, from, to);
            metrics.update_circuit_breaker_state(&self.dependency, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "users-service",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3, 1000);

        for _ in 0..2 {
            cb.record_failure().await;
            assert!(cb.can_execute().await);
        }
        cb.record_failure().await;

        assert_eq!(cb.get_state().await, CircuitState::Open);
        assert!(!cb.can_execute().await);
        // Rejection does not count as a failure
        assert_eq!(cb.get_failure_count().await, 3);
        assert!(cb.last_failure_time().await.is_some());
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_after_timeout() {
        let cb = breaker(3, 100);

        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert!(!cb.can_execute().await);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cb.can_execute().await);
        assert_eq!(cb.get_state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(cb.get_failure_count().await, 0);
        assert!(cb.last_failure_time().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_circuit() {
        let cb = breaker(2, 50);

        cb.record_failure().await;
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.can_execute().await);

        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitState::Open);
        assert!(!cb.can_execute().await);
    }

    #[tokio::test]
    async fn test_success_forgives_prior_failures() {
        let cb = breaker(3, 1000);

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        assert_eq!(cb.get_failure_count().await, 0);

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset_closes_circuit() {
        let cb = breaker(1, 60_000);

        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitState::Open);

        cb.reset().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(cb.get_failure_count().await, 0);
        assert!(cb.can_execute().await);
    }

    #[tokio::test]
    async fn test_transitions_are_recorded_in_metrics() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let cb = breaker(1, 60_000).with_metrics(metrics.clone());

        cb.record_failure().await;

        let gathered = metrics.registry().gather();
        let transitions = gathered
            .iter()
            .find(|m| m.name() == "circuit_breaker_transitions_total")
            .unwrap();
        assert_eq!(transitions.metric.len(), 1);
        let state = gathered
            .iter()
            .find(|m| m.name() == "circuit_breaker_state")
            .unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(1.0));
    }
}
