//! Replication execution: units, monitors, tasks and the scheduler.

pub mod executor;
pub mod scheduler;
pub mod task;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::population::PopulationState;
use crate::rules::ModelSpec;
use crate::sampling::SampleSet;

pub use executor::{Batch, LocalExecutor, ReplicationExecutor};
pub use scheduler::{CampaignReport, SimulationManager};
pub use task::{replication_rng, run_batch, run_replication};

/// Everything needed to run one campaign's replications.
///
/// Immutable once submitted; owned by whichever manager currently
/// executes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationUnit {
    pub model: ModelSpec,
    pub initial: PopulationState,
    pub sampling: SampleSet,
    pub deadline: f64,
}

impl SimulationUnit {
    pub fn new(
        model: ModelSpec,
        initial: PopulationState,
        sampling: SampleSet,
        deadline: f64,
    ) -> Self {
        Self {
            model,
            initial,
            sampling,
            deadline,
        }
    }
}

/// Outcome of one dispatched batch of replications.
///
/// Carries the reduced sampling aggregate, not raw trajectories.
/// Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationResult {
    pub samples: SampleSet,
    pub completed: u32,
    pub failed: u32,
    /// Identity of the process that produced this result, when remote.
    pub origin: Option<String>,
    pub elapsed_ms: u64,
    /// Task-fatal error description, when `failed > 0`.
    pub error: Option<String>,
}

/// Progress snapshot published by a running campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: u32,
    pub failed: u32,
    pub total: u32,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// Shared cancellation flag polled at replication boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// External control surface of a running campaign: cancellation plus a
/// progress feed. Never blocks the manager.
#[derive(Debug, Clone)]
pub struct SimulationMonitor {
    cancel: CancelToken,
    progress: watch::Sender<Progress>,
}

impl SimulationMonitor {
    /// Creates a monitor for `total` replications together with the
    /// receiving end of its progress feed.
    pub fn new(total: u32) -> (Self, watch::Receiver<Progress>) {
        let (progress, receiver) = watch::channel(Progress {
            completed: 0,
            failed: 0,
            total,
        });
        (
            Self {
                cancel: CancelToken::new(),
                progress,
            },
            receiver,
        )
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Subscribes a new consumer to the progress feed.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub(crate) fn record(&self, completed: u32, failed: u32) {
        self.progress.send_modify(|p| {
            p.completed += completed;
            p.failed += failed;
        });
    }
}

/// Elapsed wall-clock time as whole milliseconds for result envelopes.
pub(crate) fn elapsed_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis().min(u64::MAX as u128) as u64
}
