use pipewise::config::Config;
use pipewise::controller::aggregator::Aggregator;
use pipewise::controller::analysis::AnalysisEngine;
use pipewise::controller::clients::{HttpCollectorHealth, HttpExecutionClient, HttpTemplateClient};
use pipewise::controller::clock::SystemClock;
use pipewise::controller::events::HttpEventSink;
use pipewise::controller::experiment::{recover, run_controller, Context, StateMachine};
use pipewise::controller::prometheus::PrometheusClient;
use pipewise::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use pipewise::store::{MemoryStore, SqliteStore, Store};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Open the configured store: SQLite when a path is set, memory otherwise
fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match config.database_path {
        Some(ref path) => {
            let store = SqliteStore::open(path)?;
            info!(path = %path, "Using SQLite experiment store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("PIPEWISE_DATABASE_PATH not set - experiments are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting pipewise experiment controller");

    let config = Config::from_env()?;
    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let store = open_store(&config)?;

    // Collaborators
    let templates = Arc::new(HttpTemplateClient::new(
        config.template_service_url.clone(),
        config.call_timeout,
    ));
    let execution = Arc::new(HttpExecutionClient::new(
        config.execution_service_url.clone(),
        config.call_timeout,
        config.readiness_poll_interval,
    ));
    let collector_health = Arc::new(HttpCollectorHealth::new(
        config.collector_health_url.clone(),
        config.call_timeout,
    ));
    let metrics_source = Arc::new(PrometheusClient::new(
        config.prometheus_address.clone(),
        config.call_timeout,
    ));
    info!(address = %config.prometheus_address, "Prometheus client configured");

    let events = Arc::new(HttpEventSink::new(
        config.events_enabled,
        config.events_sink_url.clone(),
        config.call_timeout,
    ));
    info!(enabled = config.events_enabled, "Event sink configured");

    let clock = Arc::new(SystemClock);
    let aggregator = Aggregator::new(
        store.clone(),
        metrics_source.clone(),
        collector_health,
        execution.clone(),
        clock.clone(),
        config.aggregator_settings(),
    )
    .with_metrics(metrics.clone());

    let machine = Arc::new(StateMachine::new(
        Context {
            store,
            templates,
            execution,
            metrics_source,
            aggregator: Arc::new(aggregator),
            engine: AnalysisEngine::new(config.analysis_settings()),
            events,
            clock,
            settings: config.machine_settings(),
            metrics: Some(metrics.clone()),
        },
        shutdown_signal.clone(),
    ));

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_store = machine.context().store.clone();
    let health_shutdown = shutdown_signal.clone();
    let health_port = config.health_port;
    let store_timeout = config.call_timeout;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(
            health_port,
            health_readiness,
            health_metrics,
            health_store,
            store_timeout,
            health_shutdown,
        )
        .await
        {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = health_port, "Health server task spawned");

    match recover(&machine).await {
        Ok(recovered) => info!(recovered, "Recovered in-flight experiments"),
        Err(e) => {
            error!(error = %e, "Failed to recover in-flight experiments");
            return Err(e.into());
        }
    }

    readiness.set_serving();
    info!("Controller ready, starting experiment loop");

    let controller = run_controller(
        machine.clone(),
        config.controller_settings(),
        shutdown_signal.clone(),
    );

    // Run controller until shutdown signal received
    tokio::select! {
        _ = controller => {
            info!("Controller loop ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            readiness.set_draining();
        }
    }

    // Stops the loop, the health server and every experiment driver
    shutdown_controller.shutdown();

    info!("Stopping components...");
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task failed");
    }

    info!("Pipewise controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
