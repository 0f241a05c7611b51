//! Execution of single replications and batches.

use std::time::Instant;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::SimulationError;
use crate::model::PopulationModel;
use crate::trajectory::Trajectory;

use super::{CancelToken, ComputationResult, SimulationUnit, elapsed_ms};

/// Generator for one replication of a campaign.
///
/// Every replication draws from its own ChaCha stream keyed by its index,
/// so the trajectory of replication `i` is identical whether it runs
/// sequentially, on a thread pool, or on a remote slave.
pub fn replication_rng(seed: u64, replication: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(replication);
    rng
}

/// Runs one replication end-to-end and returns its trajectory.
///
/// The trajectory terminates at the deadline or when no transition is
/// enabled; both are normal terminal conditions.
///
/// # Errors
/// - `SimulationError::Weighted` - the model produced a malformed rate
pub fn run_replication(
    unit: &SimulationUnit,
    rng: &mut ChaCha8Rng,
) -> Result<Trajectory, SimulationError> {
    let started = Instant::now();
    let mut trajectory = Trajectory::new();
    let mut time = 0.0;
    let mut state = unit.initial.clone();
    trajectory.add(time, state.clone())?;

    while time < unit.deadline {
        match unit.model.next(rng, &state)? {
            Some(step) => {
                time += step.increment;
                state = step.state;
                if time > unit.deadline {
                    break;
                }
                trajectory.add(time, state.clone())?;
            }
            None => break,
        }
    }

    trajectory.set_successful(true);
    trajectory.set_generation_time_ns(started.elapsed().as_nanos().min(u64::MAX as u128) as u64);
    Ok(trajectory)
}

/// Runs `count` replications starting at `first_replication`, folding
/// each trajectory into a fresh copy of the unit's sampling grids.
///
/// Cancellation is polled at replication boundaries: a cancelled batch
/// returns the partial result accumulated so far, which is not an error.
/// A replication that fails (model bug) is counted as failed and leaves
/// the remaining replications untouched.
pub fn run_batch(
    unit: &SimulationUnit,
    seed: u64,
    first_replication: u64,
    count: u32,
    cancel: &CancelToken,
) -> ComputationResult {
    let started = Instant::now();
    let mut samples = unit.sampling.clone();
    let mut completed = 0;
    let mut failed = 0;
    let mut error = None;

    for index in 0..count as u64 {
        if cancel.is_cancelled() {
            break;
        }
        let mut rng = replication_rng(seed, first_replication + index);
        match run_replication(unit, &mut rng) {
            Ok(trajectory) => {
                trajectory.replay(&mut samples);
                completed += 1;
            }
            Err(err) => {
                tracing::warn!(replication = first_replication + index, error = %err, "replication failed");
                failed += 1;
                error.get_or_insert_with(|| err.to_string());
            }
        }
    }

    ComputationResult {
        samples,
        completed,
        failed,
        origin: None,
        elapsed_ms: elapsed_ms(started.elapsed()),
        error,
    }
}

#[cfg(test)]
mod tests {
    use crate::population::PopulationState;
    use crate::rules::{ModelSpec, Population, ReactionRule};
    use crate::sampling::{Measure, SampleSet};

    use super::*;

    fn decay_unit(deadline: f64) -> SimulationUnit {
        let model = ModelSpec::new(
            "decay",
            vec!["A".into(), "B".into()],
            vec![ReactionRule::new(
                "A->B",
                vec![Population::new(0)],
                vec![Population::new(1)],
                1.0,
            )],
        );
        SimulationUnit::new(
            model,
            PopulationState::new(vec![10, 0]),
            SampleSet::grid(10, deadline, vec![Measure::new("A", 0)]),
            deadline,
        )
    }

    #[test]
    fn replications_are_deterministic_per_stream() {
        let unit = decay_unit(100.0);
        let a = run_replication(&unit, &mut replication_rng(1, 5)).unwrap();
        let b = run_replication(&unit, &mut replication_rng(1, 5)).unwrap();
        assert_eq!(a.samples(), b.samples());

        let c = run_replication(&unit, &mut replication_rng(1, 6)).unwrap();
        assert_ne!(a.samples(), c.samples());
    }

    #[test]
    fn trajectory_exhausts_population_within_generous_deadline() {
        let unit = decay_unit(1_000.0);
        let trajectory = run_replication(&unit, &mut replication_rng(3, 0)).unwrap();
        // 10 individuals decaying at rate 1 each: 10 transitions plus the
        // initial sample.
        assert_eq!(trajectory.len(), 11);
        let last = trajectory.samples().last().unwrap();
        assert_eq!(last.state.count(0), 0);
    }

    #[test]
    fn batch_counts_every_replication() {
        let unit = decay_unit(50.0);
        let result = run_batch(&unit, 9, 0, 8, &CancelToken::new());
        assert_eq!(result.completed, 8);
        assert_eq!(result.failed, 0);
        assert!(result.error.is_none());
        assert_eq!(result.samples.samplings()[0].points()[0].count(), 8);
    }

    #[test]
    fn cancelled_batch_returns_partial_result() {
        let unit = decay_unit(50.0);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_batch(&unit, 9, 0, 8, &cancel);
        assert_eq!(result.completed, 0);
        assert_eq!(result.failed, 0);
    }
}
