//! Sample collection and success-criteria checks for the analyzing phase

use crate::controller::analysis::MetricSamples;
use crate::controller::prometheus::MetricsSource;
use crate::model::{
    deployment_id, AnalysisResult, ExperimentResults, MetricAnalysis, MetricSummary, MetricType,
    Recommendation, SuccessCriteria, Variant,
};
use futures::future::join_all;
use std::time::Duration;
use tracing::warn;

pub const OUTPUT_CARDINALITY: &str = "output_cardinality";
pub const COLLECTOR_CPU: &str = "collector_cpu";
pub const COLLECTOR_MEMORY: &str = "collector_memory";
pub const PIPELINE_LATENCY: &str = "pipeline_latency";
pub const PIPELINE_ERROR_RATE: &str = "pipeline_error_rate";
pub const CRITICAL_PROCESS_COVERAGE: &str = "critical_process_coverage";

/// A metric compared between the two variants
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMetric {
    pub name: String,
    /// Metric name or `$deployment` template handed to the metrics source
    pub query: String,
    pub metric_type: MetricType,
    /// Overrides the engine's default tolerance
    pub tolerance_pct: Option<f64>,
}

impl TrackedMetric {
    pub fn new(name: &str, query: &str, metric_type: MetricType) -> Self {
        TrackedMetric {
            name: name.to_string(),
            query: query.to_string(),
            metric_type,
            tolerance_pct: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance_pct: f64) -> Self {
        self.tolerance_pct = Some(tolerance_pct);
        self
    }
}

/// Metrics every experiment is judged on
///
/// CPU and memory tolerate exactly the overhead the success criteria allow.
pub fn default_tracked_metrics(criteria: &SuccessCriteria) -> Vec<TrackedMetric> {
    vec![
        TrackedMetric::new(
            OUTPUT_CARDINALITY,
            "pipewise_pipeline_output_cardinality",
            MetricType::Cost,
        ),
        TrackedMetric::new(
            COLLECTOR_CPU,
            "pipewise_collector_cpu_usage_ratio",
            MetricType::Cost,
        )
        .with_tolerance(criteria.max_cpu_overhead),
        TrackedMetric::new(
            COLLECTOR_MEMORY,
            "pipewise_collector_memory_bytes",
            MetricType::Cost,
        )
        .with_tolerance(criteria.max_memory_overhead),
        TrackedMetric::new(
            PIPELINE_LATENCY,
            "pipewise_pipeline_latency_seconds",
            MetricType::Latency,
        ),
        TrackedMetric::new(
            PIPELINE_ERROR_RATE,
            "pipewise_pipeline_error_rate",
            MetricType::ErrorRate,
        ),
        TrackedMetric::new(
            CRITICAL_PROCESS_COVERAGE,
            "pipewise_critical_process_coverage",
            MetricType::Throughput,
        ),
    ]
}

/// Query baseline and candidate series for every tracked metric concurrently
///
/// A failed or timed-out query yields an empty sample set, which the engine
/// reports as insufficient data.
pub async fn collect_samples(
    source: &dyn MetricsSource,
    experiment_id: &str,
    tracked: &[TrackedMetric],
    window: Duration,
    call_timeout: Duration,
) -> Vec<MetricSamples> {
    let baseline_id = deployment_id(experiment_id, Variant::Baseline);
    let candidate_id = deployment_id(experiment_id, Variant::Candidate);

    let query = |subject: &str, metric: &TrackedMetric| {
        let subject = subject.to_string();
        let metric = metric.clone();
        async move {
            match tokio::time::timeout(
                call_timeout,
                source.query_metric(&subject, &metric.query, window),
            )
            .await
            {
                Ok(Ok(samples)) => samples,
                Ok(Err(e)) => {
                    warn!(subject = %subject, metric = %metric.name, error = %e, "Metric query failed");
                    Vec::new()
                }
                Err(_) => {
                    warn!(subject = %subject, metric = %metric.name, "Metric query timed out");
                    Vec::new()
                }
            }
        }
    };

    let pairs = tracked.iter().map(|metric| {
        let baseline = query(&baseline_id, metric);
        let candidate = query(&candidate_id, metric);
        async move {
            let (baseline, candidate) = tokio::join!(baseline, candidate);
            let samples = MetricSamples::new(&metric.name, metric.metric_type, baseline, candidate);
            match metric.tolerance_pct {
                Some(tolerance) => samples.with_tolerance(tolerance),
                None => samples,
            }
        }
    });
    join_all(pairs).await
}

/// Summarize the comparison and enforce the experiment's success criteria
///
/// Violations are always recorded on the analysis; a `promote` that violates
/// any criterion is downgraded to `neutral`.
pub fn check_success_criteria(
    analysis: &mut AnalysisResult,
    criteria: &SuccessCriteria,
) -> ExperimentResults {
    let results = build_results(analysis);
    let mut violations = Vec::new();

    match results.cardinality_reduction {
        Some(reduction) if reduction >= criteria.min_cardinality_reduction => {}
        Some(reduction) => violations.push(format!(
            "cardinality reduction {:.2}% below required {:.2}%",
            reduction, criteria.min_cardinality_reduction
        )),
        None => violations.push("cardinality reduction could not be measured".to_string()),
    }
    match results.cpu_overhead {
        Some(overhead) if overhead <= criteria.max_cpu_overhead => {}
        Some(overhead) => violations.push(format!(
            "cpu overhead {:.2}% above allowed {:.2}%",
            overhead, criteria.max_cpu_overhead
        )),
        None => violations.push("cpu overhead could not be measured".to_string()),
    }
    match results.memory_overhead {
        Some(overhead) if overhead <= criteria.max_memory_overhead => {}
        Some(overhead) => violations.push(format!(
            "memory overhead {:.2}% above allowed {:.2}%",
            overhead, criteria.max_memory_overhead
        )),
        None => violations.push("memory overhead could not be measured".to_string()),
    }
    match results.critical_process_coverage {
        Some(coverage) if coverage >= criteria.min_critical_process_coverage => {}
        Some(coverage) => violations.push(format!(
            "critical process coverage {:.2}% below required {:.2}%",
            coverage, criteria.min_critical_process_coverage
        )),
        None => violations.push("critical process coverage could not be measured".to_string()),
    }

    if analysis.recommendation == Recommendation::Promote && !violations.is_empty() {
        analysis.recommendation = Recommendation::Neutral;
    }
    analysis.criteria_violations = violations;
    results
}

/// Results snapshot written to the experiment status
pub fn build_results(analysis: &AnalysisResult) -> ExperimentResults {
    let measured = |name: &str| analysis.metric(name).filter(|m| has_data(m));

    ExperimentResults {
        metrics: analysis
            .metrics
            .iter()
            .map(|m| MetricSummary {
                name: m.name.clone(),
                baseline_mean: m.baseline_mean,
                candidate_mean: m.candidate_mean,
                percent_change: m.percent_change,
            })
            .collect(),
        cardinality_reduction: measured(OUTPUT_CARDINALITY).map(|m| -m.percent_change),
        cpu_overhead: measured(COLLECTOR_CPU).map(|m| m.percent_change),
        memory_overhead: measured(COLLECTOR_MEMORY).map(|m| m.percent_change),
        critical_process_coverage: measured(CRITICAL_PROCESS_COVERAGE)
            .filter(|m| m.baseline_mean > 0.0)
            .map(|m| m.candidate_mean / m.baseline_mean * 100.0),
    }
}

fn has_data(metric: &MetricAnalysis) -> bool {
    !metric.baseline.is_empty() && !metric.candidate.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::analysis::AnalysisEngine;
    use crate::controller::prometheus::{MetricsError, MockMetricsSource};

    fn flat(mean: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| mean + if i % 2 == 0 { 1.0 } else { -1.0 } * mean * 0.01)
            .collect()
    }

    fn analysis(card: (f64, f64), cpu: (f64, f64), mem: (f64, f64), cov: (f64, f64)) -> AnalysisResult {
        let tracked = default_tracked_metrics(&SuccessCriteria::default());
        let means = [card, cpu, mem, (0.2, 0.2), (0.01, 0.01), cov];
        let samples: Vec<MetricSamples> = tracked
            .iter()
            .zip(means)
            .map(|(t, (b, c))| MetricSamples::new(&t.name, t.metric_type, flat(b, 200), flat(c, 200)))
            .collect();
        AnalysisEngine::default().analyze(&samples)
    }

    #[test]
    fn test_default_metrics_take_tolerance_from_criteria() {
        let criteria = SuccessCriteria {
            max_cpu_overhead: 7.5,
            max_memory_overhead: 12.0,
            ..Default::default()
        };
        let tracked = default_tracked_metrics(&criteria);
        assert_eq!(tracked.len(), 6);

        let cpu = tracked.iter().find(|t| t.name == COLLECTOR_CPU).unwrap();
        assert_eq!(cpu.tolerance_pct, Some(7.5));
        let memory = tracked.iter().find(|t| t.name == COLLECTOR_MEMORY).unwrap();
        assert_eq!(memory.tolerance_pct, Some(12.0));
        let coverage = tracked
            .iter()
            .find(|t| t.name == CRITICAL_PROCESS_COVERAGE)
            .unwrap();
        assert!(!coverage.metric_type.lower_is_better());
    }

    #[test]
    fn test_results_snapshot_derives_overheads() {
        let result = analysis((1000.0, 700.0), (100.0, 104.0), (200.0, 190.0), (50.0, 49.5));
        let results = build_results(&result);

        assert_eq!(results.metrics.len(), 6);
        assert!((results.cardinality_reduction.unwrap() - 30.0).abs() < 1e-9);
        assert!((results.cpu_overhead.unwrap() - 4.0).abs() < 1e-9);
        assert!((results.memory_overhead.unwrap() - (-5.0)).abs() < 1e-9);
        assert!((results.critical_process_coverage.unwrap() - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_promote_meeting_criteria_stays_promote() {
        let mut result = analysis((1000.0, 700.0), (100.0, 100.0), (200.0, 200.0), (50.0, 50.0));
        assert_eq!(result.recommendation, Recommendation::Promote);

        let criteria = SuccessCriteria {
            min_cardinality_reduction: 25.0,
            ..Default::default()
        };
        check_success_criteria(&mut result, &criteria);
        assert_eq!(result.recommendation, Recommendation::Promote);
        assert!(result.criteria_violations.is_empty());
    }

    #[test]
    fn test_promote_missing_cardinality_target_is_downgraded() {
        let mut result = analysis((1000.0, 700.0), (100.0, 100.0), (200.0, 200.0), (50.0, 50.0));
        let criteria = SuccessCriteria {
            min_cardinality_reduction: 40.0,
            ..Default::default()
        };
        let results = check_success_criteria(&mut result, &criteria);

        assert_eq!(result.recommendation, Recommendation::Neutral);
        assert_eq!(result.criteria_violations.len(), 1);
        assert!(result.criteria_violations[0].starts_with("cardinality reduction 30.00%"));
        assert!(results.cardinality_reduction.is_some());
    }

    #[test]
    fn test_reject_is_never_upgraded_or_downgraded() {
        let mut result = analysis((1000.0, 700.0), (100.0, 130.0), (200.0, 200.0), (50.0, 50.0));
        assert_eq!(result.recommendation, Recommendation::Reject);
        check_success_criteria(&mut result, &SuccessCriteria::default());
        assert_eq!(result.recommendation, Recommendation::Reject);
        assert!(result.criteria_violations[0].starts_with("cpu overhead 30.00%"));
    }

    #[tokio::test]
    async fn test_collect_samples_queries_both_variants() {
        let source = MockMetricsSource::new();
        source.set_series("exp-1-baseline", "pipewise_collector_cpu_usage_ratio", vec![0.2, 0.3]);
        source.set_series("exp-1-candidate", "pipewise_collector_cpu_usage_ratio", vec![0.25]);
        let tracked = default_tracked_metrics(&SuccessCriteria::default());

        let samples = collect_samples(
            &source,
            "exp-1",
            &tracked,
            Duration::from_secs(1800),
            Duration::from_secs(30),
        )
        .await;

        assert_eq!(samples.len(), 6);
        let cpu = samples.iter().find(|s| s.name == COLLECTOR_CPU).unwrap();
        assert_eq!(cpu.baseline, vec![0.2, 0.3]);
        assert_eq!(cpu.candidate, vec![0.25]);
        assert_eq!(cpu.tolerance_pct, Some(10.0));

        // Missing series come back empty rather than failing the pass
        let latency = samples.iter().find(|s| s.name == PIPELINE_LATENCY).unwrap();
        assert!(latency.baseline.is_empty());

        let calls = source.calls();
        assert_eq!(calls.len(), 12);
        assert!(calls.iter().all(|(_, _, window)| *window == Duration::from_secs(1800)));
    }

    #[tokio::test]
    async fn test_collect_samples_survives_backend_outage() {
        let source = MockMetricsSource::new();
        source.fail_with(MetricsError::HttpError("503".to_string()));
        let tracked = default_tracked_metrics(&SuccessCriteria::default());

        let samples =
            collect_samples(&source, "exp-1", &tracked, Duration::from_secs(60), Duration::from_secs(5))
                .await;
        assert!(samples.iter().all(|s| s.baseline.is_empty() && s.candidate.is_empty()));

        let result = AnalysisEngine::default().analyze(&samples);
        assert_eq!(result.recommendation, Recommendation::Continue);
        assert!(!result.sufficient_data);
    }
}
