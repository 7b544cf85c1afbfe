//! Domain types persisted by the store and exchanged with collaborators

pub mod analysis;
pub mod deployment;
pub mod experiment;

pub use analysis::{
    AnalysisResult, ConfidenceInterval, MetricAnalysis, MetricType, Recommendation, RiskLevel,
};
pub use deployment::{
    AggregatedStatus, CollectorStatus, Deployment, DeploymentMetrics, DeploymentSpec,
    DeploymentState, HealthSummary, InstanceState, InstanceStatus,
};
pub use experiment::{
    deployment_id, Experiment, ExperimentConfig, ExperimentResults, ExperimentStatus,
    MetricSummary, Phase, SuccessCriteria, Variant,
};
