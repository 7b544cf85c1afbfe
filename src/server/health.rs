//! Health, readiness and scrape endpoints for the controller process
//!
//! - `/healthz` answers as long as the process is serving requests
//! - `/readyz` reports the controller lifecycle and whether the store answers
//! - `/metrics` serves the controller registry in Prometheus text format

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use crate::store::{ListFilter, Store};
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Where the controller is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Stage {
    /// Store opened, in-flight experiments not yet recovered
    Recovering = 0,
    /// Experiment loop is running
    Serving = 1,
    /// Shutdown signal received
    Draining = 2,
}

impl Stage {
    fn from_u8(value: u8) -> Stage {
        match value {
            1 => Stage::Serving,
            2 => Stage::Draining,
            _ => Stage::Recovering,
        }
    }
}

/// Lifecycle stage shared between `main` and the readiness handler
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    stage: Arc<AtomicU8>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recovery finished and the experiment loop is starting
    pub fn set_serving(&self) {
        self.stage.store(Stage::Serving as u8, Ordering::SeqCst);
    }

    /// Stop advertising readiness while drivers wind down
    pub fn set_draining(&self) {
        self.stage.store(Stage::Draining as u8, Ordering::SeqCst);
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::SeqCst))
    }
}

#[derive(Clone)]
struct HealthState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
    store: Arc<dyn Store>,
    store_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ReadinessReport {
    stage: Stage,
    store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

/// 200 only while serving and the store answers a one-row listing in time
async fn readyz(State(state): State<HealthState>) -> (StatusCode, Json<ReadinessReport>) {
    let stage = state.readiness.stage();
    if stage != Stage::Serving {
        let report = ReadinessReport {
            stage,
            store: "unchecked",
            error: None,
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(report));
    }

    let filter = ListFilter {
        phase: None,
        limit: 1,
        offset: 0,
    };
    let listing = state.store.list(&filter);
    let error = match tokio::time::timeout(state.store_timeout, listing).await {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no answer within {:?}", state.store_timeout)),
    };

    match error {
        None => (
            StatusCode::OK,
            Json(ReadinessReport {
                stage,
                store: "ok",
                error: None,
            }),
        ),
        Some(error) => {
            warn!(error = %error, "Readiness check: experiment store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessReport {
                    stage,
                    store: "unavailable",
                    error: Some(error),
                }),
            )
        }
    }
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Serve the health endpoints on `port` until `shutdown` fires
///
/// `store_timeout` bounds the store check behind `/readyz`.
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    store: Arc<dyn Store>,
    store_timeout: Duration,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .with_state(HealthState {
            readiness,
            metrics,
            store,
            store_timeout,
        });

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!(port = %port, "Health and metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(std::io::Error::other)
}
