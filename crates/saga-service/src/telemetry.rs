//! Tracing subscriber and Prometheus recorder setup.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, ServiceConfig};
use crate::error::{Result, ServiceError};

/// Builds the filter from the configured directive, falling back to `info`.
pub fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &ServiceConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(&config.log_level));

    let installed = match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    installed.map_err(|err| ServiceError::Telemetry(err.to_string()))
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| ServiceError::Telemetry(err.to_string()))
}
