use serde::Deserialize;
use std::time::Duration;

use crate::rpc::ResilienceConfig;

// ============================================================================
// Settings
// ============================================================================
//
// Numeric knobs come from the environment (RPC_TIMEOUT_MS, ...) with fixed
// defaults. Keys are the lower-cased variable names.
//
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub rpc_timeout_ms: u64,
    pub rpc_retry_attempts: u32,
    pub rpc_retry_delay_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_ms: u64,

    pub tx_retry_attempts: u32,
    pub tx_retry_base_delay_ms: u64,
    pub tx_timeout_ms: u64,

    pub broker_url: String,
    pub broker_client_id: String,
    pub broker_ready_grace_ms: u64,

    /// In-memory storage when unset
    pub database_url: Option<String>,

    pub metrics_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_env_source(config::Environment::default())
    }

    /// Load from a specific environment source (tests pass an explicit map)
    pub fn from_env_source(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("rpc_timeout_ms", 5000)?
            .set_default("rpc_retry_attempts", 2)?
            .set_default("rpc_retry_delay_ms", 1000)?
            .set_default("circuit_breaker_threshold", 5)?
            .set_default("circuit_breaker_timeout_ms", 60000)?
            .set_default("tx_retry_attempts", 3)?
            .set_default("tx_retry_base_delay_ms", 100)?
            .set_default("tx_timeout_ms", 10000)?
            .set_default("broker_url", "127.0.0.1:9092")?
            .set_default("broker_client_id", "service-reliability")?
            .set_default("broker_ready_grace_ms", 1000)?
            .set_default("database_url", None::<String>)?
            .set_default("metrics_port", 9090)?
            .add_source(source.try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig {
            request_timeout: Duration::from_millis(self.rpc_timeout_ms),
            retry_attempts: self.rpc_retry_attempts,
            retry_delay: Duration::from_millis(self.rpc_retry_delay_ms),
            failure_threshold: self.circuit_breaker_threshold,
            reset_timeout: Duration::from_millis(self.circuit_breaker_timeout_ms),
        }
    }

    pub fn tx_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.tx_retry_base_delay_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn broker_ready_grace(&self) -> Duration {
        Duration::from_millis(self.broker_ready_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_env_source(config::Environment::default().source(Some(map))).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = load(&[]);

        assert_eq!(settings.rpc_timeout_ms, 5000);
        assert_eq!(settings.rpc_retry_attempts, 2);
        assert_eq!(settings.rpc_retry_delay_ms, 1000);
        assert_eq!(settings.circuit_breaker_threshold, 5);
        assert_eq!(settings.circuit_breaker_timeout_ms, 60000);
        assert_eq!(settings.tx_retry_attempts, 3);
        assert_eq!(settings.broker_url, "127.0.0.1:9092");
        assert_eq!(settings.database_url, None);
        assert_eq!(settings.metrics_port, 9090);
    }

    #[test]
    fn test_environment_overrides() {
        let settings = load(&[
            ("RPC_TIMEOUT_MS", "250"),
            ("CIRCUIT_BREAKER_THRESHOLD", "3"),
            ("DATABASE_URL", "postgres://localhost/app"),
        ]);

        assert_eq!(settings.rpc_timeout_ms, 250);
        assert_eq!(settings.circuit_breaker_threshold, 3);
        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/app"));
    }

    #[test]
    fn test_resilience_config_from_settings() {
        let resilience = load(&[("RPC_RETRY_DELAY_MS", "50")]).resilience();

        assert_eq!(resilience.request_timeout, Duration::from_millis(5000));
        assert_eq!(resilience.retry_attempts, 2);
        assert_eq!(resilience.retry_delay, Duration::from_millis(50));
        assert_eq!(resilience.failure_threshold, 5);
        assert_eq!(resilience.reset_timeout, Duration::from_secs(60));
    }
}
