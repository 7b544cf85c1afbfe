//! HTTP server for health and metrics endpoints
//!
//! Provides health checks and scraping:
//! - `/healthz` - Liveness (process is running)
//! - `/readyz` - Readiness (recovery finished and the store answers)
//! - `/metrics` - Prometheus text format
//!
//! Also provides the shutdown/cancellation signal used across the controller.

mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{run_health_server, ReadinessState, Stage};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
