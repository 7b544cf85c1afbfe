use crate::model::experiment::Variant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline deployment for one experiment variant
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    #[serde(rename = "experimentId")]
    pub experiment_id: String,
    pub variant: Variant,
    /// Pipeline template the deployment runs
    pub pipeline: String,
    pub namespace: String,
    #[serde(rename = "desiredInstances")]
    pub desired_instances: u32,
    #[serde(rename = "readyInstances", default)]
    pub ready_instances: u32,
    #[serde(rename = "updatedInstances", default)]
    pub updated_instances: u32,
    #[serde(default)]
    pub instances: Vec<InstanceStatus>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Request sent to the execution layer to roll out one variant
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeploymentSpec {
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,
    #[serde(rename = "experimentId")]
    pub experiment_id: String,
    pub variant: Variant,
    pub pipeline: String,
    pub namespace: String,
    #[serde(rename = "nodeSelector")]
    pub node_selector: BTreeMap<String, String>,
    /// Rendered collector configuration from the template service
    pub config: String,
}

/// Live state of one pipeline instance as reported by the execution layer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InstanceStatus {
    pub name: String,
    pub node: String,
    pub state: InstanceState,
    pub ready: bool,
    #[serde(rename = "restartCount", default)]
    pub restart_count: u32,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

impl InstanceStatus {
    pub fn is_healthy(&self) -> bool {
        self.ready && self.state == InstanceState::Running
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Coarse per-collector signal from the pipeline-health backend
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CollectorStatus {
    pub name: String,
    pub node: String,
    pub healthy: bool,
    #[serde(rename = "lastHeartbeat", skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Deployment-level telemetry from the metrics backend
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DeploymentMetrics {
    /// Data points per second emitted by the pipeline
    #[serde(rename = "metricsRate", skip_serializing_if = "Option::is_none")]
    pub metrics_rate: Option<f64>,
    /// Fraction of failed exports, 0.0 to 1.0
    #[serde(rename = "errorRate", skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HealthSummary {
    #[serde(rename = "healthyInstances")]
    pub healthy_instances: u32,
    #[serde(rename = "unhealthyInstances")]
    pub unhealthy_instances: u32,
    #[serde(rename = "metricsRate")]
    pub metrics_rate: f64,
    #[serde(rename = "errorRate")]
    pub error_rate: f64,
    pub issues: Vec<String>,
    #[serde(rename = "isHealthy")]
    pub is_healthy: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Progressing,
    Ready,
    Degraded,
    Failed,
    Unknown,
}

/// Merged view of a deployment produced by the aggregator
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AggregatedStatus {
    pub deployment: Deployment,
    pub status: DeploymentState,
    /// Phase of the owning experiment, when it could be looked up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub instances: Vec<InstanceStatus>,
    pub metrics: DeploymentMetrics,
    #[serde(rename = "healthSummary")]
    pub health_summary: HealthSummary,
    #[serde(rename = "collectorStatuses")]
    pub collector_statuses: Vec<CollectorStatus>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl AggregatedStatus {
    /// Whether the readiness gate for entering `running` is satisfied
    pub fn is_ready(&self) -> bool {
        self.status == DeploymentState::Ready
    }
}
