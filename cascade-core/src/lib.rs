//! Stochastic population-model simulation core for Cascade.
//!
//! Provides the weighted-random-choice primitive driving each simulation
//! step, population models with mass-action reaction rules, trajectory
//! recording and statistical sampling, and the replication scheduler that
//! runs campaigns against a pluggable executor (local worker pool or
//! remote dispatch).

pub mod config;
pub mod model;
pub mod population;
pub mod rules;
pub mod sampling;
pub mod simulator;
pub mod trajectory;
pub mod weighted;

use thiserror::Error;

pub use config::SimulationConfig;
pub use model::{PopulationModel, TimeStep};
pub use population::PopulationState;
pub use rules::{ModelId, ModelSpec, Population, ReactionRule};
pub use sampling::{Measure, SampleSet, SamplingFunction, StatisticSampling, SummaryStatistics};
pub use simulator::{
    Batch, CampaignReport, CancelToken, ComputationResult, LocalExecutor, Progress,
    ReplicationExecutor, SimulationManager, SimulationMonitor, SimulationUnit, replication_rng,
    run_batch, run_replication,
};
pub use trajectory::{Sample, Trajectory};
pub use weighted::{
    ComposedWeightedStructure, WeightedElement, WeightedError, WeightedStructure, WeightedTree,
};

/// Errors produced by the simulation core.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Weighted(#[from] WeightedError),

    #[error("Invalid model: {reason}")]
    InvalidModel { reason: String },

    #[error("Trajectory sample at t={time} is earlier than the previous sample")]
    OutOfOrderSample { time: f64 },

    #[error("Cannot merge sampling data: {reason}")]
    MergeMismatch { reason: String },

    #[error("Executor failure: {reason}")]
    Executor { reason: String },
}
