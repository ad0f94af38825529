//! Saga service: the surface external callers use, plus process plumbing.
//!
//! - [`SagaService`]: start, resume and inspect sagas; statistics and health
//! - [`ServiceConfig`]: environment-driven settings
//! - [`telemetry`]: tracing subscriber and Prometheus recorder
//! - [`MaintenanceWorker`]: periodic lock purge, timeout recovery and gauge
//!   publication, run by the `saga-worker` binary

pub mod config;
pub mod error;
pub mod service;
pub mod telemetry;
pub mod worker;

pub use config::{LogFormat, ServiceConfig};
pub use error::{Result, ServiceError};
pub use service::SagaService;
pub use worker::{MaintenanceWorker, SweepReport};
