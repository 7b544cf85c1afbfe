use crate::model::analysis::AnalysisResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Experiment comparing a baseline telemetry pipeline against a candidate
///
/// `config` is fixed at creation; `status`, `phase` and `metadata` are the
/// only parts a store update may change.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phase: Phase,
    pub config: ExperimentConfig,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    /// Create a new `pending` experiment
    ///
    /// An empty `id` is replaced with a random UUID.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        config: ExperimentConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let mut id = id.into();
        if id.is_empty() {
            id = uuid::Uuid::new_v4().to_string();
        }
        Experiment {
            id,
            name: name.into(),
            description: String::new(),
            phase: Phase::Pending,
            config,
            status: ExperimentStatus::default(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Immutable experiment configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExperimentConfig {
    /// Pipeline template used by the control variant
    #[serde(rename = "baselinePipeline")]
    pub baseline_pipeline: String,

    /// Pipeline template under evaluation
    #[serde(rename = "candidatePipeline")]
    pub candidate_pipeline: String,

    /// Node labels selecting the hosts both variants run on
    #[serde(rename = "targetNodes", default)]
    pub target_nodes: BTreeMap<String, String>,

    /// Planned duration of the running phase, e.g. "30m" or "2h"
    pub duration: String,

    /// Thresholds the candidate must meet to be promoted
    #[serde(rename = "successCriteria", default)]
    pub success_criteria: SuccessCriteria,

    /// Extra parameters forwarded to the template service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Promotion thresholds, all expressed as percentages
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SuccessCriteria {
    /// Required drop in output time series, e.g. 20.0 for 20%
    #[serde(rename = "minCardinalityReduction")]
    pub min_cardinality_reduction: f64,

    /// Allowed CPU increase over baseline
    #[serde(rename = "maxCpuOverhead")]
    pub max_cpu_overhead: f64,

    /// Allowed memory increase over baseline
    #[serde(rename = "maxMemoryOverhead")]
    pub max_memory_overhead: f64,

    /// Share of critical processes the candidate must still report
    #[serde(rename = "minCriticalProcessCoverage")]
    pub min_critical_process_coverage: f64,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        SuccessCriteria {
            min_cardinality_reduction: 0.0,
            max_cpu_overhead: 10.0,
            max_memory_overhead: 10.0,
            min_critical_process_coverage: 100.0,
        }
    }
}

/// Mutable experiment status
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExperimentStatus {
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Human-readable explanation of the latest transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Statistical report produced by the analyzing phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,

    /// Final results snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ExperimentResults>,
}

/// Summary of the comparison written when analysis finishes
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExperimentResults {
    #[serde(default)]
    pub metrics: Vec<MetricSummary>,

    #[serde(rename = "cardinalityReduction", skip_serializing_if = "Option::is_none")]
    pub cardinality_reduction: Option<f64>,

    #[serde(rename = "cpuOverhead", skip_serializing_if = "Option::is_none")]
    pub cpu_overhead: Option<f64>,

    #[serde(rename = "memoryOverhead", skip_serializing_if = "Option::is_none")]
    pub memory_overhead: Option<f64>,

    #[serde(rename = "criticalProcessCoverage", skip_serializing_if = "Option::is_none")]
    pub critical_process_coverage: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetricSummary {
    pub name: String,
    #[serde(rename = "baselineMean")]
    pub baseline_mean: f64,
    #[serde(rename = "candidateMean")]
    pub candidate_mean: f64,
    #[serde(rename = "percentChange")]
    pub percent_change: f64,
}

/// Lifecycle phase of an experiment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, waiting to be started
    Pending,
    /// Templates validated and both variants being deployed
    Initializing,
    /// Both variants deployed, collecting data for the planned duration
    Running,
    /// Collecting samples and running the statistical comparison
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Pending,
        Phase::Initializing,
        Phase::Running,
        Phase::Analyzing,
        Phase::Completed,
        Phase::Failed,
        Phase::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Analyzing => "analyzing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Phases reachable from this one in a single transition
    pub fn successors(&self) -> &'static [Phase] {
        match self {
            Phase::Pending => &[Phase::Initializing, Phase::Cancelled],
            Phase::Initializing => &[Phase::Running, Phase::Failed, Phase::Cancelled],
            Phase::Running => &[Phase::Analyzing, Phase::Failed, Phase::Cancelled],
            Phase::Analyzing => &[Phase::Completed, Phase::Failed],
            Phase::Completed | Phase::Failed | Phase::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: Phase) -> bool {
        self.successors().contains(&target)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown phase: {}", s))
    }
}

/// Pipeline variant within an experiment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Candidate,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Candidate => "candidate",
        }
    }

    /// Pipeline template name this variant runs
    pub fn pipeline<'a>(&self, config: &'a ExperimentConfig) -> &'a str {
        match self {
            Variant::Baseline => &config.baseline_pipeline,
            Variant::Candidate => &config.candidate_pipeline,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment ID used for one variant of an experiment
pub fn deployment_id(experiment_id: &str, variant: Variant) -> String {
    format!("{}-{}", experiment_id, variant.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            baseline_pipeline: "process-baseline-v1".to_string(),
            candidate_pipeline: "process-topk-v1".to_string(),
            target_nodes: BTreeMap::new(),
            duration: "30m".to_string(),
            success_criteria: SuccessCriteria::default(),
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn test_new_experiment_is_pending_with_generated_id() {
        let now = Utc::now();
        let exp = Experiment::new("", "topk trial", config(), now);

        assert_eq!(exp.phase, Phase::Pending);
        assert_eq!(exp.created_at, now);
        assert_eq!(exp.updated_at, now);
        assert!(uuid::Uuid::parse_str(&exp.id).is_ok());
    }

    #[test]
    fn test_caller_assigned_id_is_kept() {
        let exp = Experiment::new("exp-1", "trial", config(), Utc::now());
        assert_eq!(exp.id, "exp-1");
    }

    #[test]
    fn test_terminal_phases_have_no_successors() {
        for phase in [Phase::Completed, Phase::Failed, Phase::Cancelled] {
            assert!(phase.is_terminal());
            assert!(phase.successors().is_empty());
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(Phase::Pending.can_transition_to(Phase::Initializing));
        assert!(Phase::Pending.can_transition_to(Phase::Cancelled));
        assert!(!Phase::Pending.can_transition_to(Phase::Running));
        assert!(Phase::Initializing.can_transition_to(Phase::Failed));
        assert!(Phase::Running.can_transition_to(Phase::Analyzing));
        assert!(!Phase::Analyzing.can_transition_to(Phase::Cancelled));
        assert!(!Phase::Completed.can_transition_to(Phase::Running));
    }

    #[test]
    fn test_every_phase_reachable_from_pending() {
        let mut seen = vec![Phase::Pending];
        let mut frontier = vec![Phase::Pending];
        while let Some(phase) = frontier.pop() {
            for next in phase.successors() {
                if !seen.contains(next) {
                    seen.push(*next);
                    frontier.push(*next);
                }
            }
        }
        assert_eq!(seen.len(), Phase::ALL.len());
    }

    #[test]
    fn test_phase_string_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("progressing".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
    }

    #[test]
    fn test_deployment_id() {
        assert_eq!(deployment_id("exp-1", Variant::Candidate), "exp-1-candidate");
        assert_eq!(Variant::Baseline.pipeline(&config()), "process-baseline-v1");
    }
}
