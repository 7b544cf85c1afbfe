pub mod aggregator;
pub mod analysis;
pub mod clients;
pub mod clock;
pub mod events;
pub mod experiment;
pub mod prometheus;
pub mod statistics;

pub use aggregator::{AggregationError, Aggregator, AggregatorSettings};
pub use analysis::{AnalysisEngine, AnalysisSettings, MetricSamples};
pub use experiment::{
    recover, run_controller, Context, ControllerSettings, MachineSettings, PhaseTask,
    StateMachine, TransitionError,
};
