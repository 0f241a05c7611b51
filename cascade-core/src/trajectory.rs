//! Timed state sequences recorded by single replications.

use serde::{Deserialize, Serialize};

use crate::SimulationError;
use crate::population::PopulationState;
use crate::sampling::SamplingFunction;

/// One timed observation of a replication's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub state: PopulationState,
}

/// Append-only record of one replication: (time, state) pairs with
/// strictly non-decreasing times.
///
/// A trajectory is terminal when its deadline was reached or no further
/// transition was possible. The `successful` flag marks whether the final
/// state satisfied the replication's goal, when one was set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    samples: Vec<Sample>,
    successful: bool,
    generation_time_ns: u64,
}

impl Default for Trajectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Trajectory {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            successful: false,
            generation_time_ns: 0,
        }
    }

    /// Appends an observation.
    ///
    /// # Errors
    /// - `SimulationError::OutOfOrderSample` - `time` precedes the last sample
    pub fn add(&mut self, time: f64, state: PopulationState) -> Result<(), SimulationError> {
        if let Some(last) = self.samples.last()
            && time < last.time
        {
            return Err(SimulationError::OutOfOrderSample { time });
        }
        self.samples.push(Sample { time, state });
        Ok(())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time of the first observation.
    pub fn start(&self) -> Option<f64> {
        self.samples.first().map(|s| s.time)
    }

    /// Time of the last observation.
    pub fn end(&self) -> Option<f64> {
        self.samples.last().map(|s| s.time)
    }

    pub fn successful(&self) -> bool {
        self.successful
    }

    pub fn set_successful(&mut self, successful: bool) {
        self.successful = successful;
    }

    pub fn generation_time_ns(&self) -> u64 {
        self.generation_time_ns
    }

    pub fn set_generation_time_ns(&mut self, nanos: u64) {
        self.generation_time_ns = nanos;
    }

    /// Feeds the recorded sequence through a sampling function, folding
    /// this replication into its running statistics.
    pub fn replay(&self, sampling: &mut dyn SamplingFunction) {
        let Some(end) = self.end() else {
            return;
        };
        sampling.start();
        for sample in &self.samples {
            sampling.sample(sample.time, &sample.state);
        }
        sampling.end(end);
    }
}
