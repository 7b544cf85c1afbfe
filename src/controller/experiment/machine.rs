//! Experiment state machine
//!
//! `transition_to` validates the requested edge, persists the new phase and
//! only then hands phase work to a per-experiment driver task. Each unit of
//! phase work returns the next transition instead of issuing it, and the
//! driver persists it and continues with the following phase. Work for one
//! experiment is therefore strictly sequential while different experiments
//! progress in parallel.
//!
//! Cancellation is explicit: `transition_to(id, cancelled)` persists the
//! phase and then fires the experiment's signal so pending waits end. The
//! process-wide shutdown signal stops drivers without touching the record.

use super::evaluation::{check_success_criteria, collect_samples, default_tracked_metrics};
use super::provisioning::provision;
use super::validation::{parse_duration, validate_experiment};
use crate::controller::aggregator::Aggregator;
use crate::controller::analysis::AnalysisEngine;
use crate::controller::clients::{ExecutionClient, TemplateClient};
use crate::controller::clock::Clock;
use crate::controller::events::{EventSink, ExperimentEvent};
use crate::controller::prometheus::MetricsSource;
use crate::model::{AnalysisResult, Experiment, ExperimentResults, Phase, Recommendation};
use crate::server::{shutdown_channel, SharedMetrics, ShutdownController, ShutdownSignal};
use crate::store::{Store, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Message recorded when analysis rejects the candidate
pub const REJECTED_MESSAGE: &str = "Analysis rejected candidate configuration";

/// Backoff between attempts when the store is unavailable mid-drive
const PERSIST_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("experiment not found: {0}")]
    NotFound(String),

    #[error("invalid experiment: {0}")]
    ValidationFailed(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("conflicting update: {0}")]
    Conflict(String),
}

impl TransitionError {
    /// Label used for the rejected-transition counter
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionError::InvalidTransition { .. } => "invalid_transition",
            TransitionError::NotFound(_) => "not_found",
            TransitionError::ValidationFailed(_) => "validation_failed",
            TransitionError::StoreUnavailable(_) => "store_unavailable",
            TransitionError::Conflict(_) => "conflict",
        }
    }
}

impl From<StoreError> for TransitionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id, .. } => TransitionError::NotFound(id),
            StoreError::AlreadyExists { id, .. } => {
                TransitionError::Conflict(format!("experiment {} already exists", id))
            }
            StoreError::Conflict(id) => TransitionError::Conflict(id),
            e @ StoreError::PhaseChanged { .. } => TransitionError::Conflict(e.to_string()),
            StoreError::Unavailable(reason) => TransitionError::StoreUnavailable(reason),
            other => TransitionError::StoreUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettings {
    /// Namespace both variants are deployed into
    pub namespace: String,
    /// Bound on the readiness wait, per variant
    pub readiness_timeout: Duration,
    /// Delay between aggregator polls while waiting for readiness
    pub readiness_poll_interval: Duration,
    /// Bound on every client and metrics call
    pub call_timeout: Duration,
}

impl Default for MachineSettings {
    fn default() -> Self {
        MachineSettings {
            namespace: "pipewise-experiments".to_string(),
            readiness_timeout: Duration::from_secs(300),
            readiness_poll_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Collaborators injected into the state machine
pub struct Context {
    pub store: Arc<dyn Store>,
    pub templates: Arc<dyn TemplateClient>,
    pub execution: Arc<dyn ExecutionClient>,
    pub metrics_source: Arc<dyn MetricsSource>,
    pub aggregator: Arc<Aggregator>,
    pub engine: AnalysisEngine,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: MachineSettings,
    /// When Some, records transitions and analysis outcomes
    pub metrics: Option<SharedMetrics>,
}

/// Handle on the driver task started by a transition
///
/// Transitions into phases without work (terminal phases) return an idle
/// task that completes immediately.
#[must_use = "await the task or drop it to let the phase run detached"]
pub struct PhaseTask {
    handle: Option<JoinHandle<()>>,
}

impl PhaseTask {
    fn idle() -> Self {
        PhaseTask { handle: None }
    }

    pub fn is_idle(&self) -> bool {
        self.handle.is_none()
    }

    /// Wait for the driver to stop
    pub async fn wait(self) {
        if let Some(handle) = self.handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Experiment driver task failed");
            }
        }
    }
}

/// Next transition produced by a unit of phase work
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NextTransition {
    pub phase: Phase,
    pub message: String,
    pub analysis: Option<AnalysisResult>,
    pub results: Option<ExperimentResults>,
}

impl NextTransition {
    fn to(phase: Phase, message: impl Into<String>) -> Self {
        NextTransition {
            phase,
            message: message.into(),
            analysis: None,
            results: None,
        }
    }
}

struct Driver {
    generation: u64,
    cancel: ShutdownController,
}

pub struct StateMachine {
    ctx: Arc<Context>,
    drivers: Arc<Mutex<HashMap<String, Driver>>>,
    generation: AtomicU64,
    shutdown: ShutdownSignal,
}

impl StateMachine {
    pub fn new(ctx: Context, shutdown: ShutdownSignal) -> Self {
        StateMachine {
            ctx: Arc::new(ctx),
            drivers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Validate and persist a new `pending` experiment
    pub async fn create(&self, experiment: &Experiment) -> Result<(), TransitionError> {
        validate_experiment(experiment).map_err(TransitionError::ValidationFailed)?;
        if experiment.phase != Phase::Pending {
            return Err(TransitionError::ValidationFailed(format!(
                "new experiments must be pending, got {}",
                experiment.phase
            )));
        }
        self.ctx.store.create(experiment).await?;
        info!(experiment = %experiment.id, name = %experiment.name, "Experiment created");
        Ok(())
    }

    /// Move an experiment to `target` and start that phase's work
    ///
    /// The record is left untouched when the edge does not exist or the
    /// lookup fails. Errors raised by phase work are never returned here;
    /// the driver resolves them by transitioning to `failed`.
    pub async fn transition_to(
        &self,
        id: &str,
        target: Phase,
        message: Option<String>,
    ) -> Result<PhaseTask, TransitionError> {
        let message = message.unwrap_or_else(|| default_message(target));
        let experiment = persist(&self.ctx, id, NextTransition::to(target, message))
            .await
            .inspect_err(|e| {
                if let Some(ref metrics) = self.ctx.metrics {
                    metrics.record_rejected_transition(e.kind());
                }
            })?;

        if target.is_terminal() {
            self.cancel_driver(id);
        }
        Ok(self.start_driver(experiment))
    }

    /// Restart phase work for an experiment already in a working phase
    ///
    /// Used when the controller restarts; nothing is persisted.
    pub async fn resume(&self, id: &str) -> Result<PhaseTask, TransitionError> {
        let experiment = self.ctx.store.get(id).await?;
        info!(experiment = %id, phase = %experiment.phase, "Resuming phase work");
        Ok(self.start_driver(experiment))
    }

    /// Whether a driver is currently registered for `id`
    pub fn is_active(&self, id: &str) -> bool {
        self.lock_drivers().contains_key(id)
    }

    fn start_driver(&self, experiment: Experiment) -> PhaseTask {
        if !has_work(experiment.phase) {
            return PhaseTask::idle();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (cancel, cancelled) = shutdown_channel();
        // A replaced driver sees its sender dropped and stops
        self.lock_drivers()
            .insert(experiment.id.clone(), Driver { generation, cancel });

        let ctx = self.ctx.clone();
        let drivers = self.drivers.clone();
        let shutdown = self.shutdown.clone();
        let id = experiment.id.clone();
        let handle = tokio::spawn(async move {
            drive(ctx, experiment, cancelled, shutdown).await;
            let mut drivers = drivers.lock().unwrap_or_else(|e| e.into_inner());
            if drivers.get(&id).map(|d| d.generation) == Some(generation) {
                drivers.remove(&id);
            }
        });
        PhaseTask {
            handle: Some(handle),
        }
    }

    fn cancel_driver(&self, id: &str) {
        if let Some(driver) = self.lock_drivers().remove(id) {
            debug!(experiment = %id, "Signalling phase work to stop");
            driver.cancel.shutdown();
        }
    }

    fn lock_drivers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Driver>> {
        self.drivers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn has_work(phase: Phase) -> bool {
    matches!(phase, Phase::Initializing | Phase::Running | Phase::Analyzing)
}

fn default_message(target: Phase) -> String {
    match target {
        Phase::Pending => "Experiment created".to_string(),
        Phase::Initializing => "Validating templates and deploying variants".to_string(),
        Phase::Running => "Collecting data from both variants".to_string(),
        Phase::Analyzing => "Analyzing collected metrics".to_string(),
        Phase::Completed => "Experiment completed".to_string(),
        Phase::Failed => "Experiment failed".to_string(),
        Phase::Cancelled => "Cancelled by request".to_string(),
    }
}

/// Validate the edge and write the new phase
///
/// The write only lands if the stored phase is still the one the edge was
/// checked against, otherwise it fails with `Conflict`. `updated_at` never
/// moves backwards, even if the clock does.
async fn persist(
    ctx: &Context,
    id: &str,
    next: NextTransition,
) -> Result<Experiment, TransitionError> {
    let mut experiment = ctx.store.get(id).await?;
    let from = experiment.phase;
    if !from.can_transition_to(next.phase) {
        warn!(experiment = %id, from = %from, to = %next.phase, "Rejected invalid transition");
        return Err(TransitionError::InvalidTransition {
            from,
            to: next.phase,
        });
    }

    let now = ctx.clock.now().max(experiment.updated_at);
    experiment.phase = next.phase;
    experiment.status.message = Some(next.message.clone());
    if next.phase == Phase::Running {
        experiment.status.start_time = Some(now);
    }
    if next.phase.is_terminal() {
        experiment.status.end_time = Some(now);
    }
    if next.analysis.is_some() {
        experiment.status.analysis = next.analysis;
    }
    if next.results.is_some() {
        experiment.status.results = next.results;
    }
    experiment.updated_at = now;
    ctx.store.transition(&experiment, from).await?;

    info!(
        experiment = %id,
        from = %from,
        to = %next.phase,
        message = %next.message,
        "Experiment phase changed"
    );
    if let Some(ref metrics) = ctx.metrics {
        metrics.record_transition(from.as_str(), next.phase.as_str());
    }
    let event = ExperimentEvent::transition(id, from, next.phase, Some(next.message), now);
    if let Err(e) = ctx.events.send(&event).await {
        warn!(experiment = %id, error = %e, "Failed to emit phase event");
    }
    Ok(experiment)
}

/// Run phase work until a phase without work is reached or the driver is stopped
async fn drive(
    ctx: Arc<Context>,
    mut experiment: Experiment,
    mut cancelled: ShutdownSignal,
    mut shutdown: ShutdownSignal,
) {
    let id = experiment.id.clone();
    while has_work(experiment.phase) {
        let phase = experiment.phase;
        let next = tokio::select! {
            next = run_phase(&ctx, &experiment) => next,
            _ = cancelled.wait() => {
                info!(experiment = %id, phase = %phase, "Phase work cancelled");
                return;
            }
            _ = shutdown.wait() => {
                info!(experiment = %id, phase = %phase, "Phase work interrupted by shutdown");
                return;
            }
        };

        experiment = match advance(&ctx, &id, next, &mut cancelled, &mut shutdown).await {
            Some(updated) => updated,
            None => return,
        };
    }
}

/// Persist the transition produced by phase work
///
/// A record that moved on stops the driver. An unavailable store is retried
/// with backoff; once retries run out the experiment is failed on a
/// best-effort basis so it does not sit in a working phase with no driver.
async fn advance(
    ctx: &Context,
    id: &str,
    next: NextTransition,
    cancelled: &mut ShutdownSignal,
    shutdown: &mut ShutdownSignal,
) -> Option<Experiment> {
    let mut delays = PERSIST_RETRY_DELAYS.iter();
    loop {
        let err = match persist(ctx, id, next.clone()).await {
            Ok(updated) => return Some(updated),
            Err(e @ TransitionError::StoreUnavailable(_)) => e,
            Err(e) => {
                info!(experiment = %id, to = %next.phase, error = %e, "Experiment moved on, stopping phase work");
                return None;
            }
        };

        let Some(delay) = delays.next() else {
            error!(experiment = %id, to = %next.phase, error = %err, "Giving up on recording transition");
            let reason = format!("could not record transition to {}: {}", next.phase, err);
            if let Err(e) = persist(ctx, id, NextTransition::to(Phase::Failed, reason)).await {
                error!(experiment = %id, error = %e, "Could not mark experiment failed");
            }
            return None;
        };

        warn!(experiment = %id, to = %next.phase, error = %err, retry_in = ?delay, "Store unavailable, retrying transition");
        tokio::select! {
            _ = tokio::time::sleep(*delay) => {}
            _ = cancelled.wait() => return None,
            _ = shutdown.wait() => return None,
        }
    }
}

async fn run_phase(ctx: &Context, experiment: &Experiment) -> NextTransition {
    match experiment.phase {
        Phase::Initializing => initialize(ctx, experiment).await,
        Phase::Running => run(ctx, experiment).await,
        Phase::Analyzing => analyze(ctx, experiment).await,
        other => NextTransition::to(Phase::Failed, format!("no work defined for phase {}", other)),
    }
}

async fn initialize(ctx: &Context, experiment: &Experiment) -> NextTransition {
    match provision(ctx, experiment).await {
        Ok(()) => NextTransition::to(Phase::Running, "Both variants deployed and ready"),
        Err(e) => {
            warn!(experiment = %experiment.id, error = %e, "Provisioning failed");
            NextTransition::to(Phase::Failed, e.to_string())
        }
    }
}

/// Wait out the remainder of the planned duration
async fn run(ctx: &Context, experiment: &Experiment) -> NextTransition {
    let Some(duration) = parse_duration(&experiment.config.duration) else {
        return NextTransition::to(
            Phase::Failed,
            format!("invalid duration '{}'", experiment.config.duration),
        );
    };

    let elapsed = experiment
        .status
        .start_time
        .and_then(|start| (ctx.clock.now() - start).to_std().ok())
        .unwrap_or_default();
    let remaining = duration.saturating_sub(elapsed);
    debug!(experiment = %experiment.id, remaining = ?remaining, "Experiment timer armed");
    tokio::time::sleep(remaining).await;

    NextTransition::to(Phase::Analyzing, "Experiment duration elapsed")
}

async fn analyze(ctx: &Context, experiment: &Experiment) -> NextTransition {
    let started = Instant::now();
    let config = &experiment.config;
    let window = parse_duration(&config.duration).unwrap_or(ctx.settings.readiness_timeout);

    let tracked = default_tracked_metrics(&config.success_criteria);
    let samples = collect_samples(
        ctx.metrics_source.as_ref(),
        &experiment.id,
        &tracked,
        window,
        ctx.settings.call_timeout,
    )
    .await;

    let mut analysis = ctx.engine.analyze(&samples);
    let results = check_success_criteria(&mut analysis, &config.success_criteria);

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_analysis(
            analysis.recommendation.as_str(),
            started.elapsed().as_secs_f64(),
        );
    }
    info!(
        experiment = %experiment.id,
        recommendation = %analysis.recommendation,
        confidence = analysis.confidence,
        sufficient_data = analysis.sufficient_data,
        violations = analysis.criteria_violations.len(),
        "Analysis finished"
    );

    let (phase, message) = decide(&analysis);
    NextTransition {
        phase,
        message,
        analysis: Some(analysis),
        results: Some(results),
    }
}

/// Map an analysis verdict onto a terminal phase
///
/// Inconclusive verdicts complete as a weak pass rather than extending the run.
pub(crate) fn decide(analysis: &AnalysisResult) -> (Phase, String) {
    match analysis.recommendation {
        Recommendation::Promote if analysis.sufficient_data => (
            Phase::Completed,
            format!(
                "Candidate promoted with confidence {:.2}",
                analysis.confidence
            ),
        ),
        Recommendation::Reject => (Phase::Failed, REJECTED_MESSAGE.to_string()),
        other => (
            Phase::Completed,
            format!(
                "Weak pass: recommendation {} with confidence {:.2}",
                other, analysis.confidence
            ),
        ),
    }
}

#[cfg(test)]
#[path = "machine_test.rs"]
mod tests;
