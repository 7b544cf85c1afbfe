//! Background loop driving experiments forward
//!
//! On start it recovers experiments left in a working phase by a previous
//! process, then polls for `pending` experiments and starts them.

use super::machine::{StateMachine, TransitionError};
use crate::model::Phase;
use crate::server::ShutdownSignal;
use crate::store::ListFilter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message recorded on experiments interrupted mid-provisioning
pub const RESTARTED_DURING_INITIALIZATION: &str = "controller restarted during initialization";

const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// How often to look for pending experiments
    pub interval: Duration,
    /// Start pending experiments automatically
    pub auto_start: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            interval: Duration::from_secs(10),
            auto_start: true,
        }
    }
}

/// Resolve experiments a previous process left in a working phase
///
/// Provisioning cannot be resumed safely, so `initializing` experiments
/// fail. `running` timers are re-armed with the remaining duration and
/// `analyzing` experiments are analyzed again. Returns how many experiments
/// were recovered.
pub async fn recover(machine: &StateMachine) -> Result<usize, TransitionError> {
    let store = &machine.context().store;
    let mut recovered = 0;
    let mut offset = 0;

    loop {
        let page = store
            .list(&ListFilter {
                phase: None,
                limit: PAGE_SIZE,
                offset,
            })
            .await?;
        let fetched = page.len();

        for experiment in page {
            let outcome = match experiment.phase {
                Phase::Initializing => machine
                    .transition_to(
                        &experiment.id,
                        Phase::Failed,
                        Some(RESTARTED_DURING_INITIALIZATION.to_string()),
                    )
                    .await
                    .map(|_| ()),
                Phase::Running | Phase::Analyzing => {
                    machine.resume(&experiment.id).await.map(|_| ())
                }
                _ => continue,
            };
            match outcome {
                Ok(()) => {
                    recovered += 1;
                    info!(experiment = %experiment.id, phase = %experiment.phase, "Recovered experiment");
                }
                Err(e) => {
                    warn!(experiment = %experiment.id, error = %e, "Failed to recover experiment")
                }
            }
        }

        if fetched < PAGE_SIZE {
            break;
        }
        offset += fetched;
    }

    Ok(recovered)
}

/// Start every pending experiment, returning how many were started
pub async fn start_pending(machine: &StateMachine) -> Result<usize, TransitionError> {
    let pending = machine
        .context()
        .store
        .list(&ListFilter::phase(Phase::Pending))
        .await?;

    let mut started = 0;
    for experiment in pending {
        match machine
            .transition_to(&experiment.id, Phase::Initializing, None)
            .await
        {
            Ok(_task) => started += 1,
            Err(e) => {
                warn!(experiment = %experiment.id, error = %e, "Failed to start experiment")
            }
        }
    }
    Ok(started)
}

/// Run the controller loop until `shutdown` fires
///
/// Recovery is expected to have run already (see `recover`).
pub async fn run_controller(
    machine: Arc<StateMachine>,
    settings: ControllerSettings,
    mut shutdown: ShutdownSignal,
) {
    info!(
        interval = ?settings.interval,
        auto_start = settings.auto_start,
        "Controller loop started"
    );
    let mut ticker = tokio::time::interval(settings.interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => {
                info!("Controller loop stopping");
                return;
            }
        }

        if !settings.auto_start {
            continue;
        }
        match start_pending(&machine).await {
            Ok(0) => debug!("No pending experiments"),
            Ok(started) => info!(started, "Started pending experiments"),
            Err(e) => warn!(error = %e, "Failed to list pending experiments"),
        }
    }
}
