//! Deployment status aggregation
//!
//! One status query fans out to the metrics backend, the collector-health
//! backend and the execution layer concurrently, then merges whatever came
//! back. A failing source becomes an issue entry instead of an error; only
//! a deployment missing from the store is a hard failure.

use crate::controller::clients::{CollectorHealthSource, ExecutionClient};
use crate::controller::clock::Clock;
use crate::controller::prometheus::{MetricsError, MetricsSource};
use crate::model::{
    AggregatedStatus, CollectorStatus, Deployment, DeploymentMetrics, DeploymentState,
    HealthSummary, InstanceState, InstanceStatus,
};
use crate::server::SharedMetrics;
use crate::store::{Store, StoreError};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Deployment-level series read from the metrics backend
pub const METRICS_RATE_METRIC: &str = "pipewise_pipeline_metrics_rate";
pub const ERROR_RATE_METRIC: &str = "pipewise_pipeline_error_rate";
pub const CARDINALITY_METRIC: &str = "pipewise_pipeline_output_cardinality";

/// Prefix of issues produced by a source that could not be queried
pub const SOURCE_UNAVAILABLE: &str = "source unavailable";

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("deployment {0} not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AggregationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id, .. } => AggregationError::NotFound(id),
            other => AggregationError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    /// Restarts above this flag an instance as crash-looping
    pub restart_threshold: u32,
    /// Export error fraction above this is an issue
    pub error_rate_threshold: f64,
    /// Bound on each source query
    pub call_timeout: Duration,
    /// Trailing window for deployment-level metrics
    pub metrics_window: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        AggregatorSettings {
            restart_threshold: 5,
            error_rate_threshold: 0.05,
            call_timeout: Duration::from_secs(30),
            metrics_window: Duration::from_secs(300),
        }
    }
}

pub struct Aggregator {
    store: Arc<dyn Store>,
    metrics_source: Arc<dyn MetricsSource>,
    collector_health: Arc<dyn CollectorHealthSource>,
    execution: Arc<dyn ExecutionClient>,
    clock: Arc<dyn Clock>,
    settings: AggregatorSettings,
    metrics: Option<SharedMetrics>,
}

/// Outcome of one source: the data, or why it is missing
type SourceResult<T> = Result<T, String>;

impl Aggregator {
    pub fn new(
        store: Arc<dyn Store>,
        metrics_source: Arc<dyn MetricsSource>,
        collector_health: Arc<dyn CollectorHealthSource>,
        execution: Arc<dyn ExecutionClient>,
        clock: Arc<dyn Clock>,
        settings: AggregatorSettings,
    ) -> Self {
        Aggregator {
            store,
            metrics_source,
            collector_health,
            execution,
            clock,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Best-effort merged status of one deployment
    pub async fn get_aggregated_status(
        &self,
        deployment_id: &str,
    ) -> Result<AggregatedStatus, AggregationError> {
        let deployment = self.store.get_deployment(deployment_id).await?;

        let (metrics, collectors, instances, phase) = tokio::join!(
            self.bounded(self.fetch_metrics(deployment_id)),
            self.bounded(self.collector_health.collector_statuses(deployment_id)),
            self.bounded(self.execution.list_instances(deployment_id)),
            self.store.get(&deployment.experiment_id),
        );

        let mut source_issues = Vec::new();
        let metrics = self.settle("metrics", deployment_id, metrics, &mut source_issues);
        let collectors =
            self.settle("collector_health", deployment_id, collectors, &mut source_issues);
        let instances = self.settle("instances", deployment_id, instances, &mut source_issues);
        let phase = phase.ok().map(|e| e.phase.to_string());

        Ok(self.merge(
            deployment,
            phase,
            metrics.unwrap_or_default(),
            collectors,
            instances,
            source_issues,
        ))
    }

    /// Apply the per-call deadline to one source query
    async fn bounded<T, E: Display>(
        &self,
        query: impl Future<Output = Result<T, E>>,
    ) -> SourceResult<T> {
        match tokio::time::timeout(self.settings.call_timeout, query).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.settings.call_timeout)),
        }
    }

    fn settle<T>(
        &self,
        source: &str,
        deployment_id: &str,
        result: SourceResult<T>,
        issues: &mut Vec<String>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(
                    deployment = %deployment_id,
                    source = source,
                    error = %error,
                    "Status source failed, continuing with partial data"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_source_failure(source);
                }
                issues.push(format!("{}: {}: {}", SOURCE_UNAVAILABLE, source, error));
                None
            }
        }
    }

    async fn fetch_metrics(&self, deployment_id: &str) -> Result<DeploymentMetrics, MetricsError> {
        let window = self.settings.metrics_window;
        let (rate, errors, cardinality) = tokio::join!(
            self.metrics_source
                .query_metric(deployment_id, METRICS_RATE_METRIC, window),
            self.metrics_source
                .query_metric(deployment_id, ERROR_RATE_METRIC, window),
            self.metrics_source
                .query_metric(deployment_id, CARDINALITY_METRIC, window),
        );
        Ok(DeploymentMetrics {
            metrics_rate: latest(rate)?,
            error_rate: latest(errors)?,
            cardinality: latest(cardinality)?,
        })
    }

    fn merge(
        &self,
        mut deployment: Deployment,
        phase: Option<String>,
        metrics: DeploymentMetrics,
        collectors: Option<Vec<CollectorStatus>>,
        instances: Option<Vec<InstanceStatus>>,
        source_issues: Vec<String>,
    ) -> AggregatedStatus {
        let instances_known = instances.is_some();
        let instances = instances.unwrap_or_default();

        // An empty report carries no information; fall back like a failure
        let collectors = collectors.filter(|c| !c.is_empty());
        let reported_collectors = collectors.is_some();
        let collector_statuses =
            collectors.unwrap_or_else(|| instances.iter().map(derive_collector).collect());

        let (summary, crash_looping) = self.summarize(
            &metrics,
            instances_known.then_some(instances.as_slice()),
            deployment.desired_instances,
            reported_collectors.then_some(collector_statuses.as_slice()),
            source_issues,
        );

        let desired = deployment.desired_instances.max(1);
        let status = if !instances_known {
            DeploymentState::Unknown
        } else if summary.healthy_instances >= desired && summary.is_healthy {
            DeploymentState::Ready
        } else if summary.healthy_instances == 0 && crash_looping {
            DeploymentState::Failed
        } else if crash_looping || summary.healthy_instances >= desired {
            DeploymentState::Degraded
        } else {
            DeploymentState::Progressing
        };

        if instances_known {
            deployment.ready_instances = summary.healthy_instances;
            deployment.updated_instances = instances.len() as u32;
            deployment.instances = instances.clone();
        }

        debug!(
            deployment = %deployment.id,
            status = ?status,
            healthy = summary.healthy_instances,
            unhealthy = summary.unhealthy_instances,
            issues = summary.issues.len(),
            "Aggregated deployment status"
        );

        AggregatedStatus {
            deployment,
            status,
            phase,
            instances,
            metrics,
            health_summary: summary,
            collector_statuses,
            last_updated: self.clock.now(),
        }
    }

    /// Health summary plus whether any instance is crash-looping
    ///
    /// `instances` is None when the execution layer could not be reached.
    /// Without an instance list there is nothing to call healthy.
    fn summarize(
        &self,
        metrics: &DeploymentMetrics,
        instances: Option<&[InstanceStatus]>,
        desired_instances: u32,
        reported_collectors: Option<&[CollectorStatus]>,
        source_issues: Vec<String>,
    ) -> (HealthSummary, bool) {
        let instances_known = instances.is_some();
        let instances = instances.unwrap_or_default();
        let healthy = instances.iter().filter(|i| i.is_healthy()).count() as u32;
        let unhealthy = instances.len() as u32 - healthy;
        let error_rate = metrics.error_rate.unwrap_or(0.0);

        let mut issues = Vec::new();
        let mut crash_looping = false;
        for instance in instances {
            if instance.restart_count > self.settings.restart_threshold {
                crash_looping = true;
                issues.push(format!(
                    "instance {} on {} restarted {} times",
                    instance.name, instance.node, instance.restart_count
                ));
            } else if instance.state == InstanceState::Failed {
                crash_looping = true;
                issues.push(format!("instance {} on {} failed", instance.name, instance.node));
            }
        }
        if error_rate >= self.settings.error_rate_threshold {
            issues.push(format!(
                "error rate {:.2}% not below {:.2}%",
                error_rate * 100.0,
                self.settings.error_rate_threshold * 100.0
            ));
        }
        for collector in reported_collectors.unwrap_or_default() {
            if !collector.healthy {
                issues.push(format!(
                    "collector {} on {} unhealthy{}",
                    collector.name,
                    collector.node,
                    collector
                        .message
                        .as_deref()
                        .map(|m| format!(": {}", m))
                        .unwrap_or_default()
                ));
            }
        }

        // Metrics and collector outages are reported but do not count against health
        let has_instances = !instances.is_empty() || desired_instances == 0;
        let is_healthy = instances_known && has_instances && unhealthy == 0 && issues.is_empty();
        issues.extend(source_issues);

        let summary = HealthSummary {
            healthy_instances: healthy,
            unhealthy_instances: unhealthy,
            metrics_rate: metrics.metrics_rate.unwrap_or(0.0),
            error_rate,
            issues,
            is_healthy,
        };
        (summary, crash_looping)
    }
}

/// Most recent sample; a series with no data is absent rather than failed
fn latest(result: Result<Vec<f64>, MetricsError>) -> Result<Option<f64>, MetricsError> {
    match result {
        Ok(samples) => Ok(samples.last().copied()),
        Err(MetricsError::NoData) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Collector status inferred from the execution layer's view of an instance
fn derive_collector(instance: &InstanceStatus) -> CollectorStatus {
    CollectorStatus {
        name: instance.name.clone(),
        node: instance.node.clone(),
        healthy: instance.is_healthy(),
        last_heartbeat: None,
        message: Some("derived from instance status".to_string()),
    }
}

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod tests;
