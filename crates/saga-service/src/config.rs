//! Service configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use lock_manager::MAX_LOCK_TTL;
use saga::{OrchestratorConfig, RetryPolicy};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string; unset means in-memory backends
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `5`)
/// - `SAGA_LOCK_TTL_SECS`: saga lease length, at most one day (default: `30`)
/// - `SAGA_DEFAULT_MAX_RETRIES`: retries per step (default: `3`)
/// - `SAGA_BACKOFF_BASE_MS` / `SAGA_BACKOFF_MAX_MS`: retry backoff (default: `100` / `10000`)
/// - `SAGA_DEFAULT_TIMEOUT_SECS`: saga deadline (default: `300`)
/// - `SAGA_SWEEP_INTERVAL_SECS`: maintenance sweep period (default: `15`)
/// - `METRICS_ADDR`: Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub lock_ttl: Duration,
    pub default_max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub default_timeout: Duration,
    pub sweep_interval: Duration,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.database_max_connections),
            lock_ttl: parsed("SAGA_LOCK_TTL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .filter(|ttl| *ttl <= MAX_LOCK_TTL)
                .unwrap_or(defaults.lock_ttl),
            default_max_retries: lookup("SAGA_DEFAULT_MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.default_max_retries),
            backoff_base: parsed("SAGA_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: parsed("SAGA_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            default_timeout: parsed("SAGA_DEFAULT_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            sweep_interval: parsed("SAGA_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            metrics_addr: lookup("METRICS_ADDR")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.metrics_addr),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_format),
        }
    }

    /// Retry policy applied to sagas that do not set their own.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.default_max_retries)
            .with_base_delay(self.backoff_base)
            .with_max_delay(self.backoff_max.max(self.backoff_base))
    }

    /// Orchestrator settings derived from this configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_lock_ttl(self.lock_ttl)
            .with_retry_policy(self.retry_policy())
            .with_default_timeout(Some(self.default_timeout))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            lock_ttl: Duration::from_secs(30),
            default_max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(10_000),
            default_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(15),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
