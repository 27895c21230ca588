//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::model::{IntakeDefinition, RetryPolicy};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Delivery configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Intake definitions
    #[serde(default)]
    pub intakes: Vec<IntakeDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart.
    Memory,
    /// PostgreSQL, for anything beyond local development.
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// PostgreSQL connection URL; required when backend is `postgres`.
    pub database_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            database_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// How often the scheduler scans for due records
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Outbound HTTP request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum delivery attempts in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum records picked up per scan
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum automatic retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied per subsequent retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
            max_concurrency: default_max_concurrency(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_store_backend() -> StoreBackend { StoreBackend::Memory }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_request_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_concurrency() -> usize { 16 }
fn default_batch_size() -> usize { 100 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 60_000 }

impl Config {
    /// Load configuration from environment and config files.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("INTAKE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("INTAKE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.delivery.poll_interval, Duration::from_millis(500));
        assert!(cfg.intakes.is_empty());
    }

    #[test]
    fn test_delivery_retry_policy() {
        let cfg = DeliveryConfig::default();
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay_ms, 1_000);
    }

    #[test]
    fn test_intakes_from_file_shape() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "store": { "backend": "postgres", "database_url": "postgres://localhost/intake" },
            "intakes": [{
                "id": "vendor-onboarding",
                "gates": [{ "name": "finance" }],
                "destinations": [{ "url": "https://erp.example.com/hook", "secret": "s3cret" }],
                "submissionTtl": "7d"
            }]
        }))
        .unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Postgres);
        assert_eq!(cfg.intakes.len(), 1);
        assert_eq!(
            cfg.intakes[0].submission_ttl,
            Some(Duration::from_secs(7 * 86_400))
        );
    }
}
