// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

use crate::utils::CircuitState;

// Re-export for public API
pub use server::{start_metrics_server, HealthSource};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Outbound RPC calls (outcomes, latency, retries)
// - Circuit breaker state transitions per dependency
// - Transaction retries
// - Outbox writes, including degraded writes
// - Saga compensations
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // RPC Metrics
    pub rpc_calls_total: IntCounterVec,
    pub rpc_call_duration: HistogramVec,
    pub rpc_retry_attempts_total: IntCounterVec,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGaugeVec,
    pub circuit_breaker_transitions: IntCounterVec,

    // Consistency Metrics
    pub transaction_retries_total: IntCounter,
    pub outbox_events_stored: IntCounterVec,
    pub outbox_degraded_writes: IntCounterVec,
    pub saga_compensations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let rpc_calls_total = IntCounterVec::new(
            Opts::new("rpc_calls_total", "Total outbound RPC calls by outcome"),
            &["dependency", "operation", "outcome"],
        )?;
        registry.register(Box::new(rpc_calls_total.clone()))?;

        let rpc_call_duration = HistogramVec::new(
            HistogramOpts::new("rpc_call_duration_seconds", "Outbound RPC call duration including retries")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]),
            &["dependency", "operation"],
        )?;
        registry.register(Box::new(rpc_call_duration.clone()))?;

        let rpc_retry_attempts_total = IntCounterVec::new(
            Opts::new("rpc_retry_attempts_total", "Total RPC retry attempts"),
            &["dependency", "operation"],
        )?;
        registry.register(Box::new(rpc_retry_attempts_total.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
            ),
            &["dependency"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["dependency", "from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        let transaction_retries_total = IntCounter::new(
            "transaction_retries_total",
            "Total transaction retries after conflict, deadlock or timeout",
        )?;
        registry.register(Box::new(transaction_retries_total.clone()))?;

        let outbox_events_stored = IntCounterVec::new(
            Opts::new("outbox_events_stored_total", "Outbox events written inside a transaction"),
            &["event_type"],
        )?;
        registry.register(Box::new(outbox_events_stored.clone()))?;

        let outbox_degraded_writes = IntCounterVec::new(
            Opts::new(
                "outbox_degraded_writes_total",
                "Outbox writes skipped because outbox storage was unavailable",
            ),
            &["event_type"],
        )?;
        registry.register(Box::new(outbox_degraded_writes.clone()))?;

        let saga_compensations = IntCounterVec::new(
            Opts::new("saga_compensations_total", "Saga compensation attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(saga_compensations.clone()))?;

        Ok(Self {
            registry,
            rpc_calls_total,
            rpc_call_duration,
            rpc_retry_attempts_total,
            circuit_breaker_state,
            circuit_breaker_transitions,
            transaction_retries_total,
            outbox_events_stored,
            outbox_degraded_writes,
            saga_compensations,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_rpc_call(&self, dependency: &str, operation: &str, outcome: &str, duration_secs: f64) {
        self.rpc_calls_total
            .with_label_values(&[dependency, operation, outcome])
            .inc();
        self.rpc_call_duration
            .with_label_values(&[dependency, operation])
            .observe(duration_secs);
    }

    pub fn record_retry_attempt(&self, dependency: &str, operation: &str) {
        self.rpc_retry_attempts_total
            .with_label_values(&[dependency, operation])
            .inc();
    }

    pub fn update_circuit_breaker_state(&self, dependency: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[dependency])
            .set(state.as_gauge());
    }

    pub fn record_circuit_breaker_transition(&self, dependency: &str, from: CircuitState, to: CircuitState) {
        self.circuit_breaker_transitions
            .with_label_values(&[dependency, from.as_str(), to.as_str()])
            .inc();
    }

    pub fn record_transaction_retry(&self) {
        self.transaction_retries_total.inc();
    }

    pub fn record_outbox_write(&self, event_type: &str, degraded: bool) {
        if degraded {
            self.outbox_degraded_writes.with_label_values(&[event_type]).inc();
        } else {
            self.outbox_events_stored.with_label_values(&[event_type]).inc();
        }
    }

    pub fn record_saga_compensation(&self, success: bool) {
        let outcome = if success { "compensated" } else { "failed" };
        self.saga_compensations.with_label_values(&[outcome]).inc();
    }
}
