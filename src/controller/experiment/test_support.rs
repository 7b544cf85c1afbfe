//! Shared fixture for state machine and controller loop tests

use super::evaluation::default_tracked_metrics;
use super::machine::{Context, MachineSettings, StateMachine};
use crate::controller::aggregator::{Aggregator, AggregatorSettings};
use crate::controller::analysis::AnalysisEngine;
use crate::controller::clients::{MockCollectorHealth, MockExecutionClient, MockTemplateClient};
use crate::controller::clock::ManualClock;
use crate::controller::events::MockEventSink;
use crate::controller::prometheus::MockMetricsSource;
use crate::model::{Experiment, ExperimentConfig, Phase, SuccessCriteria};
use crate::server::{create_metrics, shutdown_channel, SharedMetrics, ShutdownController};
use crate::store::{ExperimentStore, MemoryStore, Store};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) const ID: &str = "exp-1";

pub(crate) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn flat(mean: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| mean + if i % 2 == 0 { 1.0 } else { -1.0 } * mean * 0.01)
        .collect()
}

pub(crate) fn experiment(criteria: SuccessCriteria) -> Experiment {
    Experiment::new(
        ID,
        "topk trial",
        ExperimentConfig {
            baseline_pipeline: "process-baseline-v1".to_string(),
            candidate_pipeline: "process-topk-v1".to_string(),
            target_nodes: BTreeMap::new(),
            duration: "30m".to_string(),
            success_criteria: criteria,
            parameters: BTreeMap::new(),
        },
        now(),
    )
}

pub(crate) fn criteria() -> SuccessCriteria {
    SuccessCriteria {
        min_cardinality_reduction: 20.0,
        ..Default::default()
    }
}

pub(crate) struct Harness {
    pub(crate) machine: Arc<StateMachine>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) templates: Arc<MockTemplateClient>,
    pub(crate) execution: Arc<MockExecutionClient>,
    pub(crate) metrics_source: Arc<MockMetricsSource>,
    pub(crate) events: Arc<MockEventSink>,
    pub(crate) metrics: SharedMetrics,
    pub(crate) shutdown: ShutdownController,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(store.clone(), store)
    }

    /// Route the machine through `wrapper`; assertions read `memory`
    pub(crate) fn with_store(memory: Arc<MemoryStore>, wrapper: Arc<dyn Store>) -> Self {
        let templates = Arc::new(MockTemplateClient::new());
        let execution = Arc::new(MockExecutionClient::new());
        let metrics_source = Arc::new(MockMetricsSource::new());
        let events = Arc::new(MockEventSink::new());
        let clock = Arc::new(ManualClock::new(now()));
        let metrics = create_metrics().unwrap();
        let (shutdown, signal) = shutdown_channel();

        let aggregator = Aggregator::new(
            wrapper.clone(),
            metrics_source.clone(),
            Arc::new(MockCollectorHealth::new()),
            execution.clone(),
            clock.clone(),
            AggregatorSettings::default(),
        );
        let ctx = Context {
            store: wrapper,
            templates: templates.clone(),
            execution: execution.clone(),
            metrics_source: metrics_source.clone(),
            aggregator: Arc::new(aggregator),
            engine: AnalysisEngine::default(),
            events: events.clone(),
            clock,
            settings: MachineSettings::default(),
            metrics: Some(metrics.clone()),
        };

        Harness {
            machine: Arc::new(StateMachine::new(ctx, signal)),
            store: memory,
            templates,
            execution,
            metrics_source,
            events,
            metrics,
            shutdown,
        }
    }

    /// Series for every tracked metric; cardinality drops 30% and
    /// `cpu` gives the candidate's CPU mean against a baseline of 100
    pub(crate) fn seed_metrics(&self, cpu: f64) {
        let means = [
            (1000.0, 700.0),
            (100.0, cpu),
            (200.0, 200.0),
            (0.2, 0.2),
            (0.01, 0.01),
            (50.0, 50.0),
        ];
        for (metric, (baseline, candidate)) in default_tracked_metrics(&criteria()).iter().zip(means) {
            self.metrics_source
                .set_series("exp-1-baseline", &metric.query, flat(baseline, 200));
            self.metrics_source
                .set_series("exp-1-candidate", &metric.query, flat(candidate, 200));
        }
    }

    pub(crate) async fn create(&self, criteria: SuccessCriteria) {
        self.machine.create(&experiment(criteria)).await.unwrap();
    }

    /// Force a phase directly in the store
    pub(crate) async fn force_phase(&self, phase: Phase) -> Experiment {
        let mut exp = self.store.get(ID).await.unwrap();
        exp.phase = phase;
        if phase == Phase::Running {
            exp.status.start_time = Some(now());
        }
        self.store.update(&exp).await.unwrap();
        exp
    }

    pub(crate) async fn get(&self) -> Experiment {
        self.store.get(ID).await.unwrap()
    }

    pub(crate) fn event_phases(&self) -> Vec<Phase> {
        self.events.events().iter().map(|e| e.to).collect()
    }
}
