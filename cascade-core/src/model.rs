//! The population-model contract and the stochastic simulation step.

use rand::{Rng, RngCore};

use crate::population::PopulationState;
use crate::weighted::{WeightedError, WeightedStructure, WeightedTree};

/// One discrete-event step: the elapsed time increment and the new state.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeStep {
    pub increment: f64,
    pub state: PopulationState,
}

/// Contract a population model must satisfy to be simulated.
///
/// A model exposes its currently enabled transitions as a weighted
/// structure (weight = rate) and applies a selected transition to produce
/// the next state. How rates are computed is entirely up to the model.
pub trait PopulationModel: Send + Sync {
    /// Enabled transitions from `state`, weighted by their rates.
    /// Transitions are identified by model-defined indices.
    fn transitions(&self, state: &PopulationState) -> WeightedTree<usize>;

    /// Applies a transition previously returned by [`Self::transitions`].
    fn apply(&self, transition: usize, state: &PopulationState) -> PopulationState;

    /// Performs one stochastic simulation step.
    ///
    /// Standard SSA semantics: one uniform draw over `[0, total_rate)`
    /// selects the transition, a second draw over an exponential
    /// distribution with rate equal to the total weight gives the time
    /// increment. A state with no enabled transitions yields `None`,
    /// which callers treat as a normal terminal condition.
    ///
    /// # Errors
    /// - `WeightedError` - the weighted structure rejected the selection,
    ///   indicating a malformed rate (NaN or negative)
    fn next(
        &self,
        rng: &mut dyn RngCore,
        state: &PopulationState,
    ) -> Result<Option<TimeStep>, WeightedError> {
        let transitions = self.transitions(state);
        let total = transitions.total_weight();
        if total <= 0.0 {
            return Ok(None);
        }
        let r = rng.random::<f64>() * total;
        let selected = transitions.select(r.min(total * (1.0 - f64::EPSILON)))?;
        let next_state = self.apply(selected.value, state);
        let increment = exponential(rng, total);
        Ok(Some(TimeStep {
            increment,
            state: next_state,
        }))
    }
}

/// Draws from an exponential distribution with the given rate.
fn exponential(rng: &mut dyn RngCore, rate: f64) -> f64 {
    let u: f64 = rng.random();
    -(1.0 - u).ln() / rate
}
