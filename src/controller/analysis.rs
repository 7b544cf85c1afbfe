//! Statistical comparison of baseline and candidate pipelines
//!
//! Each metric is compared with a two-tailed Welch's t-test. When several
//! metrics are evaluated in one pass, p-values are Bonferroni-corrected
//! before any metric is called significant. The per-metric results are
//! then folded into a single recommendation:
//!
//! - `reject`: a metric regresses significantly beyond its tolerance
//! - `continue`: some metric lacks enough samples for a confident call
//! - `promote`: no regressions and at least one meaningful improvement
//! - `neutral`: anything else
//!
//! The engine holds no mutable state and performs no I/O.

use crate::controller::statistics::{
    bonferroni_adjust, cohens_d, mean_difference_interval, percent_change, required_sample_size,
    welch_t_test, SampleStats,
};
use crate::model::{AnalysisResult, MetricAnalysis, MetricType, Recommendation, RiskLevel};
use tracing::debug;

/// Tunables for the analysis engine
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    /// Family-wise significance level
    pub alpha: f64,
    /// Level of the reported confidence intervals
    pub confidence_level: f64,
    /// Fewer samples than this on either side means "insufficient"
    pub min_samples: usize,
    /// Power used for sample-size guidance
    pub power: f64,
    /// Smallest relative change worth detecting, e.g. 0.05 for 5%
    pub min_detectable_effect: f64,
    /// Default tolerated degradation, in percent
    pub default_tolerance_pct: f64,
    /// |Cohen's d| below this is treated as practically negligible
    pub negligible_effect_size: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        AnalysisSettings {
            alpha: 0.05,
            confidence_level: 0.95,
            min_samples: 30,
            power: 0.8,
            min_detectable_effect: 0.05,
            default_tolerance_pct: 5.0,
            negligible_effect_size: 0.2,
        }
    }
}

/// Raw samples for one tracked metric
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSamples {
    pub name: String,
    pub metric_type: MetricType,
    pub baseline: Vec<f64>,
    pub candidate: Vec<f64>,
    /// Overrides `AnalysisSettings::default_tolerance_pct`
    pub tolerance_pct: Option<f64>,
}

impl MetricSamples {
    pub fn new(
        name: impl Into<String>,
        metric_type: MetricType,
        baseline: Vec<f64>,
        candidate: Vec<f64>,
    ) -> Self {
        MetricSamples {
            name: name.into(),
            metric_type,
            baseline,
            candidate,
            tolerance_pct: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance_pct: f64) -> Self {
        self.tolerance_pct = Some(tolerance_pct);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    settings: AnalysisSettings,
}

impl AnalysisEngine {
    pub fn new(settings: AnalysisSettings) -> Self {
        AnalysisEngine { settings }
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// Compare every metric and synthesize a recommendation
    pub fn analyze(&self, samples: &[MetricSamples]) -> AnalysisResult {
        let mut metrics: Vec<MetricAnalysis> =
            samples.iter().map(|s| self.compare_metric(s)).collect();

        let adjusted_alpha = apply_bonferroni(&mut metrics, self.settings.alpha);
        let sufficient_data = !metrics.is_empty() && metrics.iter().all(|m| m.sufficient_data);

        let mut result = AnalysisResult {
            metrics,
            recommendation: Recommendation::Neutral,
            confidence: 0.0,
            sufficient_data,
            alpha: self.settings.alpha,
            adjusted_alpha,
            criteria_violations: vec![],
        };
        result.recommendation = self.recommend(&result);
        result.confidence = confidence(&result);

        debug!(
            metrics = result.metrics.len(),
            recommendation = %result.recommendation,
            confidence = result.confidence,
            sufficient_data = result.sufficient_data,
            "Analysis pass complete"
        );
        result
    }

    /// Uncorrected comparison of one metric
    fn compare_metric(&self, samples: &MetricSamples) -> MetricAnalysis {
        let baseline = finite(&samples.baseline);
        let candidate = finite(&samples.candidate);
        let b = SampleStats::from_samples(&baseline);
        let c = SampleStats::from_samples(&candidate);

        let min_samples = self.settings.min_samples.max(2);
        let pooled_variance = pooled_variance(&b, &c);
        let required = pooled_variance.and_then(|variance| {
            required_sample_size(
                variance,
                self.settings.min_detectable_effect * b.mean.abs(),
                self.settings.alpha,
                self.settings.power,
            )
        });

        let mut analysis = MetricAnalysis {
            name: samples.name.clone(),
            metric_type: samples.metric_type,
            baseline,
            candidate,
            baseline_mean: b.mean,
            candidate_mean: c.mean,
            p_value: 1.0,
            adjusted_p_value: 1.0,
            significant: false,
            effect_size: 0.0,
            percent_change: percent_change(b.mean, c.mean),
            confidence_interval: None,
            tolerance_pct: samples
                .tolerance_pct
                .unwrap_or(self.settings.default_tolerance_pct),
            required_sample_size: required,
            sufficient_data: false,
        };

        if b.n < min_samples || c.n < min_samples {
            debug!(
                metric = %samples.name,
                baseline_samples = b.n,
                candidate_samples = c.n,
                min_samples = min_samples,
                "Insufficient samples, skipping significance test"
            );
            return analysis;
        }

        // min_samples >= 2 guarantees the test can run
        if let Some(test) = welch_t_test(&b, &c) {
            analysis.p_value = test.p_value;
            analysis.effect_size = cohens_d(&b, &c);
            analysis.confidence_interval =
                Some(mean_difference_interval(&test, self.settings.confidence_level));
        }

        let needed = required.unwrap_or(0) as usize;
        analysis.sufficient_data = b.n >= needed && c.n >= needed;
        analysis
    }

    fn recommend(&self, result: &AnalysisResult) -> Recommendation {
        let metrics = &result.metrics;
        if metrics.iter().any(|m| m.exceeds_tolerance()) {
            return Recommendation::Reject;
        }
        if !result.sufficient_data {
            return Recommendation::Continue;
        }
        if result.risk_level() != RiskLevel::Low {
            return Recommendation::Neutral;
        }
        let meaningful_improvement = metrics.iter().any(|m| {
            m.is_improvement() && m.effect_size.abs() >= self.settings.negligible_effect_size
        });
        if meaningful_improvement {
            Recommendation::Promote
        } else {
            Recommendation::Neutral
        }
    }
}

/// Apply Bonferroni correction across the pass and set significance flags
///
/// Returns the effective per-metric threshold, alpha / N.
pub(crate) fn apply_bonferroni(metrics: &mut [MetricAnalysis], alpha: f64) -> f64 {
    let raw: Vec<f64> = metrics.iter().map(|m| m.p_value).collect();
    let adjusted = bonferroni_adjust(&raw);
    for (metric, adjusted_p) in metrics.iter_mut().zip(adjusted) {
        metric.adjusted_p_value = adjusted_p;
        // Equivalent to raw p < alpha / N
        metric.significant = adjusted_p < alpha;
    }
    alpha / metrics.len().max(1) as f64
}

/// Strength of evidence behind the recommendation, in [0, 1]
fn confidence(result: &AnalysisResult) -> f64 {
    let evidence = |m: &MetricAnalysis| 1.0 - m.adjusted_p_value;

    let value = if result.recommendation == Recommendation::Reject {
        result
            .metrics
            .iter()
            .filter(|m| m.exceeds_tolerance())
            .map(evidence)
            .fold(0.0, f64::max)
    } else {
        let tested: Vec<f64> = result
            .metrics
            .iter()
            .filter(|m| m.confidence_interval.is_some())
            .map(evidence)
            .collect();
        if tested.is_empty() {
            0.0
        } else {
            tested.iter().sum::<f64>() / tested.len() as f64
        }
    };
    value.clamp(0.0, 1.0)
}

fn pooled_variance(b: &SampleStats, c: &SampleStats) -> Option<f64> {
    if b.n < 2 || c.n < 2 {
        return None;
    }
    Some(
        ((b.n - 1) as f64 * b.variance + (c.n - 1) as f64 * c.variance)
            / (b.n + c.n - 2) as f64,
    )
}

fn finite(samples: &[f64]) -> Vec<f64> {
    samples.iter().copied().filter(|v| v.is_finite()).collect()
}

#[cfg(test)]
#[path = "analysis_test.rs"]
mod tests;
