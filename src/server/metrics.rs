//! Prometheus metrics for the experiment controller
//!
//! - `pipewise_phase_transitions_total{from,to}`
//! - `pipewise_transitions_rejected_total{reason}`
//! - `pipewise_analysis_duration_seconds`
//! - `pipewise_recommendations_total{recommendation}`
//! - `pipewise_aggregator_source_failures_total{source}`

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Controller metrics registered in a private registry
pub struct ControllerMetrics {
    registry: Registry,
    phase_transitions: IntCounterVec,
    rejected_transitions: IntCounterVec,
    analysis_duration: Histogram,
    recommendations: IntCounterVec,
    source_failures: IntCounterVec,
}

/// Handle shared between the state machine, the aggregator and `/metrics`
pub type SharedMetrics = Arc<ControllerMetrics>;

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let phase_transitions = IntCounterVec::new(
            Opts::new(
                "pipewise_phase_transitions_total",
                "Persisted experiment phase transitions",
            ),
            &["from", "to"],
        )?;
        let rejected_transitions = IntCounterVec::new(
            Opts::new(
                "pipewise_transitions_rejected_total",
                "Transition requests that were refused",
            ),
            &["reason"],
        )?;
        let analysis_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pipewise_analysis_duration_seconds",
                "Wall time of the analyzing phase, sample collection included",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        let recommendations = IntCounterVec::new(
            Opts::new(
                "pipewise_recommendations_total",
                "Recommendations produced by completed analyses",
            ),
            &["recommendation"],
        )?;
        let source_failures = IntCounterVec::new(
            Opts::new(
                "pipewise_aggregator_source_failures_total",
                "Aggregator sources that failed during a status query",
            ),
            &["source"],
        )?;

        registry.register(Box::new(phase_transitions.clone()))?;
        registry.register(Box::new(rejected_transitions.clone()))?;
        registry.register(Box::new(analysis_duration.clone()))?;
        registry.register(Box::new(recommendations.clone()))?;
        registry.register(Box::new(source_failures.clone()))?;

        Ok(ControllerMetrics {
            registry,
            phase_transitions,
            rejected_transitions,
            analysis_duration,
            recommendations,
            source_failures,
        })
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.phase_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_rejected_transition(&self, reason: &str) {
        self.rejected_transitions.with_label_values(&[reason]).inc();
    }

    pub fn record_analysis(&self, recommendation: &str, duration_secs: f64) {
        self.recommendations
            .with_label_values(&[recommendation])
            .inc();
        self.analysis_duration.observe(duration_secs);
    }

    pub fn record_source_failure(&self, source: &str) {
        self.source_failures.with_label_values(&[source]).inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub fn transition_count(&self, from: &str, to: &str) -> u64 {
        self.phase_transitions.with_label_values(&[from, to]).get()
    }

    #[cfg(test)]
    pub fn rejected_count(&self, reason: &str) -> u64 {
        self.rejected_transitions.with_label_values(&[reason]).get()
    }

    #[cfg(test)]
    pub fn source_failure_count(&self, source: &str) -> u64 {
        self.source_failures.with_label_values(&[source]).get()
    }
}

/// Create the shared metrics handle
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
