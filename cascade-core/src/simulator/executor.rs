//! The pluggable execution capability behind the scheduler.
//!
//! One scheduler core drives every manager variant; what differs is the
//! executor it dispatches batches to — an in-process worker pool here, a
//! pool of remote slave servers in the network layer.

use std::sync::Arc;

use async_trait::async_trait;

use crate::SimulationError;

use super::{CancelToken, ComputationResult, SimulationUnit, task};

/// A slice of a campaign: `count` replications starting at
/// `first_replication`, all drawing from streams of `seed`.
///
/// Replications are stateless and independently restartable, so a lost
/// batch is recovered by re-dispatching the same slice.
#[derive(Debug, Clone)]
pub struct Batch {
    pub unit: Arc<SimulationUnit>,
    pub seed: u64,
    pub first_replication: u64,
    pub count: u32,
    pub cancel: CancelToken,
}

/// Capability to execute replication batches on some pool of workers.
#[async_trait]
pub trait ReplicationExecutor: Send + Sync {
    /// Maximum number of batches this executor accepts in flight.
    /// May change over time (remote pools grow and shrink).
    fn capacity(&self) -> usize;

    /// Largest batch worth dispatching in one unit of work.
    fn max_batch(&self) -> u32;

    /// Executes a batch to completion.
    ///
    /// A cancelled batch resolves with a partial result. Dropping the
    /// returned future abandons the batch; the scheduler treats the lost
    /// count as re-dispatchable.
    ///
    /// # Errors
    /// - `SimulationError::Executor` - the batch was lost (worker or
    ///   transport failure) and none of its replications completed
    async fn execute(&self, batch: Batch) -> Result<ComputationResult, SimulationError>;
}

/// Executes batches on blocking threads of the local runtime.
///
/// `workers` bounds the in-flight batches; with `max_batch = 1` this is a
/// classic fixed-size worker pool pulling single replications, with a
/// larger bound it degenerates into coarse chunks.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    workers: usize,
    max_batch: u32,
}

impl LocalExecutor {
    pub fn new(workers: usize, max_batch: u32) -> Self {
        Self {
            workers: workers.max(1),
            max_batch: max_batch.max(1),
        }
    }
}

#[async_trait]
impl ReplicationExecutor for LocalExecutor {
    fn capacity(&self) -> usize {
        self.workers
    }

    fn max_batch(&self) -> u32 {
        self.max_batch
    }

    async fn execute(&self, batch: Batch) -> Result<ComputationResult, SimulationError> {
        let handle = tokio::task::spawn_blocking(move || {
            task::run_batch(
                &batch.unit,
                batch.seed,
                batch.first_replication,
                batch.count,
                &batch.cancel,
            )
        });
        handle.await.map_err(|err| SimulationError::Executor {
            reason: format!("worker thread failed: {err}"),
        })
    }
}
