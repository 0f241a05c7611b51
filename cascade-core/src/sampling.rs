//! Statistical sampling of trajectories.
//!
//! A sampling function folds a replication's timed state sequence into
//! running statistics on a fixed time grid. Grids from independent
//! replications (or independent workers) merge commutatively, which is
//! what lets results arrive in any order from any topology.

use serde::{Deserialize, Serialize};

use crate::SimulationError;
use crate::population::PopulationState;

/// Observer of one replication's (time, state) sequence.
///
/// `start` is called once before the first sample, `end` once after the
/// last with the trajectory's final time. Implementations are mutated
/// only by the thread executing the owning trajectory.
pub trait SamplingFunction: Send {
    fn start(&mut self);
    fn sample(&mut self, time: f64, state: &PopulationState);
    fn end(&mut self, time: f64);
}

/// A named observation over a state: the occupancy of one species.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub species: usize,
}

impl Measure {
    pub fn new(name: impl Into<String>, species: usize) -> Self {
        Self {
            name: name.into(),
            species,
        }
    }

    pub fn observe(&self, state: &PopulationState) -> f64 {
        state.occupancy(self.species)
    }
}

/// Running count/mean/variance accumulator with commutative merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl SummaryStatistics {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Welford's online update.
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Combines two accumulators (Chan's parallel update). Commutative up
    /// to floating-point rounding.
    pub fn merge(&mut self, other: &SummaryStatistics) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        let combined = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / combined as f64;
        self.m2 += other.m2
            + delta * delta * (self.count as f64 * other.count as f64) / combined as f64;
        self.count = combined;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    /// Sample variance; 0 with fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }
}

/// One measure sampled on a fixed grid of `samples` points spaced `dt`.
///
/// Between grid points the last observed value is carried forward, so a
/// trajectory that jumps past several grid points fills each of them with
/// the value that was current when the grid time passed. After the
/// trajectory ends, remaining grid points are filled with the final value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticSampling {
    measure: Measure,
    dt: f64,
    data: Vec<SummaryStatistics>,
    #[serde(skip)]
    last_measure: f64,
    #[serde(skip)]
    new_measure: f64,
    #[serde(skip)]
    next_time: f64,
    #[serde(skip)]
    current_index: usize,
}

impl StatisticSampling {
    /// Grid of `samples` points covering `[0, deadline]`.
    pub fn measure(measure: Measure, samples: usize, deadline: f64) -> Self {
        let dt = deadline / samples as f64;
        Self {
            measure,
            dt,
            data: vec![SummaryStatistics::new(); samples],
            last_measure: 0.0,
            new_measure: 0.0,
            next_time: 0.0,
            current_index: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.measure.name
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn points(&self) -> &[SummaryStatistics] {
        &self.data
    }

    /// Folds another grid of the same shape into this one.
    ///
    /// # Errors
    /// - `SimulationError::MergeMismatch` - measure, spacing or length differ
    pub fn merge(&mut self, other: &StatisticSampling) -> Result<(), SimulationError> {
        if self.measure != other.measure
            || self.dt != other.dt
            || self.data.len() != other.data.len()
        {
            return Err(SimulationError::MergeMismatch {
                reason: format!(
                    "incompatible sampling grids for measure '{}'",
                    self.measure.name
                ),
            });
        }
        for (mine, theirs) in self.data.iter_mut().zip(other.data.iter()) {
            mine.merge(theirs);
        }
        Ok(())
    }

    /// (time, mean, std-dev) rows for every grid point.
    pub fn time_series(&self) -> Vec<(f64, f64, f64)> {
        self.data
            .iter()
            .enumerate()
            .map(|(i, stats)| (i as f64 * self.dt, stats.mean(), stats.std_dev()))
            .collect()
    }

    fn record_sample(&mut self) {
        self.data[self.current_index].add(self.last_measure);
        self.current_index += 1;
        self.next_time += self.dt;
    }

    fn record_measure(&mut self, time: f64) {
        while self.next_time < time && self.current_index < self.data.len() {
            self.record_sample();
        }
        self.last_measure = self.new_measure;
        if self.next_time == time && self.current_index < self.data.len() {
            self.record_sample();
        }
    }
}

impl SamplingFunction for StatisticSampling {
    fn start(&mut self) {
        self.current_index = 0;
        self.next_time = 0.0;
        self.last_measure = 0.0;
        self.new_measure = 0.0;
    }

    fn sample(&mut self, time: f64, state: &PopulationState) {
        self.new_measure = self.measure.observe(state);
        if time >= self.next_time && self.current_index < self.data.len() {
            self.record_measure(time);
        } else {
            self.last_measure = self.new_measure;
        }
    }

    fn end(&mut self, _time: f64) {
        while self.current_index < self.data.len() {
            self.record_sample();
        }
    }
}

/// A set of sampling grids driven in lockstep over one trajectory.
///
/// This is both the sampling specification a campaign submits and the
/// aggregate that results merge into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    samplings: Vec<StatisticSampling>,
}

impl SampleSet {
    /// Grids of `samples` points over `[0, deadline]`, one per measure.
    pub fn grid(samples: usize, deadline: f64, measures: Vec<Measure>) -> Self {
        Self {
            samplings: measures
                .into_iter()
                .map(|m| StatisticSampling::measure(m, samples, deadline))
                .collect(),
        }
    }

    pub fn samplings(&self) -> &[StatisticSampling] {
        &self.samplings
    }

    pub fn find(&self, name: &str) -> Option<&StatisticSampling> {
        self.samplings.iter().find(|s| s.name() == name)
    }

    /// Folds another set produced from the same specification into this one.
    ///
    /// # Errors
    /// - `SimulationError::MergeMismatch` - the sets have different shapes
    pub fn merge(&mut self, other: &SampleSet) -> Result<(), SimulationError> {
        if self.samplings.len() != other.samplings.len() {
            return Err(SimulationError::MergeMismatch {
                reason: "sample sets hold different measure counts".to_string(),
            });
        }
        for (mine, theirs) in self.samplings.iter_mut().zip(other.samplings.iter()) {
            mine.merge(theirs)?;
        }
        Ok(())
    }
}

impl SamplingFunction for SampleSet {
    fn start(&mut self) {
        for sampling in &mut self.samplings {
            sampling.start();
        }
    }

    fn sample(&mut self, time: f64, state: &PopulationState) {
        for sampling in &mut self.samplings {
            sampling.sample(time, state);
        }
    }

    fn end(&mut self, time: f64) {
        for sampling in &mut self.samplings {
            sampling.end(time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_once(sampling: &mut StatisticSampling, points: &[(f64, i64)]) {
        sampling.start();
        for &(time, value) in points {
            sampling.sample(time, &PopulationState::new(vec![value]));
        }
        sampling.end(points.last().map(|p| p.0).unwrap_or(0.0));
    }

    #[test]
    fn welford_matches_direct_computation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = SummaryStatistics::new();
        for v in values {
            stats.add(v);
        }
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-12);
        assert!((stats.variance() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(stats.min(), 2.0);
        assert_eq!(stats.max(), 9.0);
    }

    #[test]
    fn merge_equals_sequential_accumulation() {
        let values = [1.0, 3.5, -2.0, 8.0, 0.25, 4.0];
        let mut whole = SummaryStatistics::new();
        for v in values {
            whole.add(v);
        }

        let mut left = SummaryStatistics::new();
        let mut right = SummaryStatistics::new();
        for v in &values[..3] {
            left.add(*v);
        }
        for v in &values[3..] {
            right.add(*v);
        }
        left.merge(&right);

        assert_eq!(left.count(), whole.count());
        assert!((left.mean() - whole.mean()).abs() < 1e-12);
        assert!((left.variance() - whole.variance()).abs() < 1e-12);
    }

    #[test]
    fn grid_carries_last_value_forward() {
        let mut sampling = StatisticSampling::measure(Measure::new("x", 0), 5, 5.0);
        // Jumps from t=0 straight past three grid points.
        run_once(&mut sampling, &[(0.0, 10), (3.5, 20)]);

        let means: Vec<f64> = sampling.points().iter().map(|s| s.mean()).collect();
        // Grid points at 0,1,2,3 see the value current when the grid time
        // passed (10); the post-jump value fills the rest.
        assert_eq!(means, vec![10.0, 10.0, 10.0, 10.0, 20.0]);
    }

    #[test]
    fn end_fills_remaining_grid_points() {
        let mut sampling = StatisticSampling::measure(Measure::new("x", 0), 4, 4.0);
        run_once(&mut sampling, &[(0.0, 7)]);
        for point in sampling.points() {
            assert_eq!(point.count(), 1);
            assert_eq!(point.mean(), 7.0);
        }
    }

    #[test]
    fn replications_accumulate_per_grid_point() {
        let mut sampling = StatisticSampling::measure(Measure::new("x", 0), 3, 3.0);
        run_once(&mut sampling, &[(0.0, 4)]);
        run_once(&mut sampling, &[(0.0, 8)]);
        for point in sampling.points() {
            assert_eq!(point.count(), 2);
            assert_eq!(point.mean(), 6.0);
        }
    }

    #[test]
    fn sample_set_merge_requires_matching_shape() {
        let mut a = SampleSet::grid(4, 4.0, vec![Measure::new("x", 0)]);
        let b = SampleSet::grid(4, 4.0, vec![Measure::new("x", 0)]);
        assert!(a.merge(&b).is_ok());

        let other_grid = SampleSet::grid(8, 4.0, vec![Measure::new("x", 0)]);
        assert!(a.merge(&other_grid).is_err());

        let other_measures = SampleSet::grid(4, 4.0, vec![]);
        assert!(a.merge(&other_measures).is_err());
    }
}
