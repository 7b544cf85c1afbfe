//! Experiment lifecycle: validation, the phase state machine, the work each
//! phase performs, and the background loop that starts and recovers
//! experiments.

pub mod controller;
pub mod evaluation;
pub mod machine;
pub mod provisioning;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use controller::{recover, run_controller, ControllerSettings};
pub use evaluation::{check_success_criteria, collect_samples, default_tracked_metrics, TrackedMetric};
pub use machine::{Context, MachineSettings, PhaseTask, StateMachine, TransitionError};
pub use provisioning::{provision, ProvisioningError};
pub use validation::{parse_duration, validate_experiment};
