//! The scheduler core shared by every simulation-manager variant.
//!
//! Keeps the queued bookkeeping — a pending replication count and a
//! bounded set of in-flight batches — and dispatches work to whatever
//! [`ReplicationExecutor`] it was built with. Lost batches are requeued
//! by count; cancellation is observed at batch boundaries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::SimulationError;
use crate::config::SimulationConfig;
use crate::sampling::SampleSet;

use super::executor::{Batch, LocalExecutor, ReplicationExecutor};
use super::{ComputationResult, SimulationMonitor, SimulationUnit};

/// Final outcome of one campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignReport {
    pub samples: SampleSet,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Schedules N replications of a simulation unit against an executor.
pub struct SimulationManager {
    executor: Arc<dyn ReplicationExecutor>,
    max_retries: u32,
    idle_backoff: Duration,
}

impl SimulationManager {
    /// Runs replications one at a time, in order, on the caller's runtime.
    /// Deterministic; intended for tests and tiny workloads.
    pub fn sequential() -> Self {
        Self::with_executor(Arc::new(LocalExecutor::new(1, u32::MAX)))
    }

    /// Runs replications on a fixed-size pool of blocking workers.
    pub fn threaded(workers: usize) -> Self {
        Self::with_executor(Arc::new(LocalExecutor::new(workers, 1)))
    }

    /// Local manager sized from configuration.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let executor = Arc::new(LocalExecutor::new(config.workers, config.max_batch));
        let mut manager = Self::with_executor(executor);
        manager.max_retries = config.max_retries;
        manager
    }

    /// Builds a manager around an arbitrary executor (the network layer
    /// plugs its remote slave pool in here).
    pub fn with_executor(executor: Arc<dyn ReplicationExecutor>) -> Self {
        Self {
            executor,
            max_retries: SimulationConfig::default().max_retries,
            idle_backoff: Duration::from_millis(200),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Runs `replications` independent replications of `unit`.
    ///
    /// Returns exactly `replications` completed-or-failed outcomes unless
    /// the monitor cancels, in which case the report is marked cancelled
    /// and carries the counts reached so far. Executor failures requeue
    /// the lost replication count up to the retry budget; replications
    /// lost beyond it are reported failed, never silently dropped.
    ///
    /// # Errors
    /// - `SimulationError::MergeMismatch` - an executor returned samples
    ///   from a different grid shape, indicating a protocol bug
    pub async fn run(
        &self,
        unit: SimulationUnit,
        replications: u32,
        seed: u64,
        monitor: &SimulationMonitor,
    ) -> Result<CampaignReport, SimulationError> {
        let started = Instant::now();
        let unit = Arc::new(unit);
        let mut aggregate = unit.sampling.clone();

        let mut pending = replications;
        let mut next_replication: u64 = 0;
        let mut completed: u32 = 0;
        let mut failed: u32 = 0;
        let mut retries: u32 = 0;

        let mut in_flight: JoinSet<Result<ComputationResult, (u32, SimulationError)>> =
            JoinSet::new();

        loop {
            while pending > 0 && !monitor.is_cancelled() && in_flight.len() < self.executor.capacity()
            {
                let count = pending.min(self.executor.max_batch());
                let batch = Batch {
                    unit: Arc::clone(&unit),
                    seed,
                    first_replication: next_replication,
                    count,
                    cancel: monitor.cancel_token(),
                };
                next_replication += count as u64;
                pending -= count;
                let executor = Arc::clone(&self.executor);
                tracing::debug!(first = batch.first_replication, count, "dispatching batch");
                in_flight.spawn(async move {
                    executor.execute(batch).await.map_err(|err| (count, err))
                });
            }

            if in_flight.is_empty() {
                if pending == 0 || monitor.is_cancelled() {
                    break;
                }
                // Nothing running and no capacity: degraded executor
                // (e.g. no live slave). Wait for capacity to return.
                tracing::warn!(pending, "executor has no capacity; campaign waiting");
                tokio::time::sleep(self.idle_backoff).await;
                continue;
            }

            match in_flight.join_next().await {
                Some(Ok(Ok(result))) => {
                    aggregate.merge(&result.samples)?;
                    completed += result.completed;
                    failed += result.failed;
                    monitor.record(result.completed, result.failed);
                    if let Some(error) = &result.error {
                        tracing::warn!(failed = result.failed, error, "batch reported failures");
                    }
                }
                Some(Ok(Err((count, err)))) => {
                    retries += 1;
                    if retries > self.max_retries {
                        tracing::error!(count, error = %err, "retry budget exhausted; marking replications failed");
                        failed += count;
                        monitor.record(0, count);
                    } else {
                        tracing::warn!(count, error = %err, retry = retries, "batch lost; requeueing");
                        pending += count;
                    }
                }
                Some(Err(join_err)) => {
                    // Only reachable when a batch task is aborted or
                    // panics; bail rather than lose count silently.
                    return Err(SimulationError::Executor {
                        reason: format!("batch task failed: {join_err}"),
                    });
                }
                None => {}
            }
        }

        Ok(CampaignReport {
            samples: aggregate,
            completed,
            failed,
            cancelled: monitor.is_cancelled(),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::population::PopulationState;
    use crate::rules::{ModelSpec, Population, ReactionRule};
    use crate::sampling::{Measure, SampleSet};
    use crate::simulator::task;

    use super::*;

    fn sir_unit(deadline: f64) -> SimulationUnit {
        let model = ModelSpec::new(
            "sir",
            vec!["S".into(), "I".into(), "R".into()],
            vec![
                ReactionRule::new(
                    "S->I",
                    vec![Population::new(0), Population::new(1)],
                    vec![Population::new(1), Population::new(1)],
                    0.004,
                ),
                ReactionRule::new(
                    "I->R",
                    vec![Population::new(1)],
                    vec![Population::new(2)],
                    1.0 / 15.0,
                ),
            ],
        );
        SimulationUnit::new(
            model,
            PopulationState::new(vec![95, 5, 0]),
            SampleSet::grid(20, deadline, vec![Measure::new("I", 1)]),
            deadline,
        )
    }

    #[tokio::test]
    async fn sequential_runs_every_replication() {
        let manager = SimulationManager::sequential();
        let (monitor, progress) = SimulationMonitor::new(12);
        let report = manager.run(sir_unit(30.0), 12, 17, &monitor).await.unwrap();
        assert_eq!(report.completed, 12);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);
        assert_eq!(report.samples.samplings()[0].points()[0].count(), 12);
        assert!(progress.borrow().is_done());
    }

    #[tokio::test]
    async fn threaded_matches_sequential_statistics() {
        let replications = 24;
        let seed = 99;

        let (monitor_a, _) = SimulationMonitor::new(replications);
        let sequential = SimulationManager::sequential()
            .run(sir_unit(30.0), replications, seed, &monitor_a)
            .await
            .unwrap();

        let (monitor_b, _) = SimulationMonitor::new(replications);
        let threaded = SimulationManager::threaded(4)
            .run(sir_unit(30.0), replications, seed, &monitor_b)
            .await
            .unwrap();

        assert_eq!(threaded.completed, sequential.completed);
        let a = sequential.samples.samplings()[0].time_series();
        let b = threaded.samples.samplings()[0].time_series();
        for ((_, mean_a, std_a), (_, mean_b, std_b)) in a.iter().zip(b.iter()) {
            assert!((mean_a - mean_b).abs() < 1e-9);
            assert!((std_a - std_b).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn configured_batching_matches_sequential_statistics() {
        let replications = 24;
        let seed = 7;

        let (monitor_a, _) = SimulationMonitor::new(replications);
        let sequential = SimulationManager::sequential()
            .run(sir_unit(30.0), replications, seed, &monitor_a)
            .await
            .unwrap();

        // Workers pull multi-replication chunks instead of single
        // replications; counts and statistics must not change.
        let config = SimulationConfig {
            workers: 3,
            max_retries: 1,
            max_batch: 8,
        };
        let (monitor_b, _) = SimulationMonitor::new(replications);
        let batched = SimulationManager::from_config(&config)
            .run(sir_unit(30.0), replications, seed, &monitor_b)
            .await
            .unwrap();

        assert_eq!(batched.completed, replications);
        assert_eq!(batched.failed, 0);
        let a = sequential.samples.samplings()[0].time_series();
        let b = batched.samples.samplings()[0].time_series();
        for ((_, mean_a, _), (_, mean_b, _)) in a.iter().zip(b.iter()) {
            assert!((mean_a - mean_b).abs() < 1e-9);
        }
    }

    /// Fails the first dispatch, then delegates to a local pool.
    struct FlakyExecutor {
        inner: LocalExecutor,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ReplicationExecutor for FlakyExecutor {
        fn capacity(&self) -> usize {
            self.inner.capacity()
        }

        fn max_batch(&self) -> u32 {
            4
        }

        async fn execute(&self, batch: Batch) -> Result<ComputationResult, SimulationError> {
            let should_fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(SimulationError::Executor {
                    reason: "synthetic transport failure".to_string(),
                });
            }
            self.inner.execute(batch).await
        }
    }

    #[tokio::test]
    async fn lost_batches_are_requeued() {
        let executor = Arc::new(FlakyExecutor {
            inner: LocalExecutor::new(2, 4),
            failures: AtomicU32::new(2),
        });
        let manager = SimulationManager::with_executor(executor);
        let (monitor, _) = SimulationMonitor::new(10);
        let report = manager.run(sir_unit(20.0), 10, 5, &monitor).await.unwrap();
        assert_eq!(report.completed + report.failed, 10);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_replications_failed() {
        let executor = Arc::new(FlakyExecutor {
            inner: LocalExecutor::new(1, 4),
            failures: AtomicU32::new(u32::MAX),
        });
        let manager = SimulationManager::with_executor(executor).max_retries(2);
        let (monitor, _) = SimulationMonitor::new(4);
        let report = manager.run(sir_unit(20.0), 4, 5, &monitor).await.unwrap();
        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, 4);
    }

    #[tokio::test]
    async fn cancellation_reports_partial_results() {
        let manager = SimulationManager::sequential();
        let (monitor, _) = SimulationMonitor::new(1000);
        monitor.cancel();
        let report = manager.run(sir_unit(30.0), 1000, 3, &monitor).await.unwrap();
        assert!(report.cancelled);
        assert!(report.completed < 1000);
    }

    #[tokio::test]
    async fn first_transition_share_matches_weights() {
        // Two transitions of weight 3 and 1 from the initial state: over
        // 4000 replications the heavy one fires first in roughly 3000.
        let model = ModelSpec::new(
            "three-to-one",
            vec!["A".into(), "B".into(), "C".into()],
            vec![
                ReactionRule::new(
                    "A->B",
                    vec![Population::new(0)],
                    vec![Population::new(1)],
                    3.0,
                ),
                ReactionRule::new(
                    "A->C",
                    vec![Population::new(0)],
                    vec![Population::new(2)],
                    1.0,
                ),
            ],
        );
        let unit = SimulationUnit::new(
            model,
            PopulationState::new(vec![1, 0, 0]),
            SampleSet::grid(1, 10.0, vec![Measure::new("B", 1)]),
            10.0,
        );

        let replications = 4_000;
        let mut heavy_first = 0;
        for i in 0..replications {
            let mut rng = task::replication_rng(123, i);
            let trajectory = task::run_replication(&unit, &mut rng).unwrap();
            let first = &trajectory.samples()[1];
            if first.state.count(1) == 1 {
                heavy_first += 1;
            }
        }
        let expected = replications as f64 * 0.75;
        let tolerance = replications as f64 * 0.75 * 0.05;
        assert!(
            ((heavy_first as f64) - expected).abs() < tolerance,
            "heavy transition fired first {heavy_first} times"
        );
    }
}
