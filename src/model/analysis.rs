use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of metric being compared, which fixes its desired direction
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Latency,
    Throughput,
    ErrorRate,
    Cost,
}

impl MetricType {
    /// Whether a decrease counts as an improvement
    pub fn lower_is_better(&self) -> bool {
        match self {
            MetricType::Latency | MetricType::ErrorRate | MetricType::Cost => true,
            MetricType::Throughput => false,
        }
    }
}

/// Overall verdict of an analysis pass
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Reject,
    Continue,
    Neutral,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Promote => "promote",
            Recommendation::Reject => "reject",
            Recommendation::Continue => "continue",
            Recommendation::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Two-sided interval for `candidate_mean - baseline_mean`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

/// Comparison of one metric between baseline and candidate
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetricAnalysis {
    pub name: String,
    #[serde(rename = "metricType")]
    pub metric_type: MetricType,
    pub baseline: Vec<f64>,
    pub candidate: Vec<f64>,
    #[serde(rename = "baselineMean")]
    pub baseline_mean: f64,
    #[serde(rename = "candidateMean")]
    pub candidate_mean: f64,
    /// Raw two-tailed Welch p-value (1.0 when the test could not run)
    #[serde(rename = "pValue")]
    pub p_value: f64,
    /// p-value after Bonferroni correction across the analysis pass
    #[serde(rename = "adjustedPValue")]
    pub adjusted_p_value: f64,
    pub significant: bool,
    /// Cohen's d, candidate minus baseline
    #[serde(rename = "effectSize")]
    pub effect_size: f64,
    #[serde(rename = "percentChange")]
    pub percent_change: f64,
    #[serde(rename = "confidenceInterval", skip_serializing_if = "Option::is_none")]
    pub confidence_interval: Option<ConfidenceInterval>,
    /// Largest tolerated degradation, in percent
    #[serde(rename = "tolerancePct")]
    pub tolerance_pct: f64,
    #[serde(rename = "requiredSampleSize", skip_serializing_if = "Option::is_none")]
    pub required_sample_size: Option<u64>,
    #[serde(rename = "sufficientData")]
    pub sufficient_data: bool,
}

impl MetricAnalysis {
    /// Percent change oriented so that positive means "worse"
    pub fn degradation_pct(&self) -> f64 {
        if self.metric_type.lower_is_better() {
            self.percent_change
        } else {
            -self.percent_change
        }
    }

    /// Significant change in the desired direction
    pub fn is_improvement(&self) -> bool {
        self.significant && self.degradation_pct() < 0.0
    }

    /// Significant change in the undesired direction
    pub fn is_regression(&self) -> bool {
        self.significant && self.degradation_pct() > 0.0
    }

    /// Significant regression larger than the metric tolerates
    pub fn exceeds_tolerance(&self) -> bool {
        self.is_regression() && self.degradation_pct() > self.tolerance_pct
    }
}

/// Result of one analysis pass over all tracked metrics
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisResult {
    pub metrics: Vec<MetricAnalysis>,
    pub recommendation: Recommendation,
    /// Aggregate strength of evidence in [0, 1]
    pub confidence: f64,
    #[serde(rename = "sufficientData")]
    pub sufficient_data: bool,
    /// Family-wise significance level
    pub alpha: f64,
    /// Per-metric threshold after Bonferroni correction
    #[serde(rename = "adjustedAlpha")]
    pub adjusted_alpha: f64,
    /// Success criteria the candidate failed to meet
    #[serde(rename = "criteriaViolations", default, skip_serializing_if = "Vec::is_empty")]
    pub criteria_violations: Vec<String>,
}

impl AnalysisResult {
    /// Coarse risk band from the worst regression observed
    pub fn risk_level(&self) -> RiskLevel {
        self.metrics
            .iter()
            .map(|m| {
                if m.exceeds_tolerance() {
                    RiskLevel::High
                } else if m.is_regression() || m.degradation_pct() > m.tolerance_pct {
                    RiskLevel::Medium
                } else {
                    RiskLevel::Low
                }
            })
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricAnalysis> {
        self.metrics.iter().find(|m| m.name == name)
    }
}
