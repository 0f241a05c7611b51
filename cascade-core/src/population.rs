//! Population states: occupancy vectors over a fixed species set.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a population model: how many individuals occupy each species.
///
/// Indices are positions in the owning model's species list. States are
/// immutable; transitions produce a new state via [`PopulationState::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationState {
    occupancy: Vec<i64>,
}

impl PopulationState {
    pub fn new(occupancy: Vec<i64>) -> Self {
        Self { occupancy }
    }

    /// Number of species slots in this state.
    pub fn len(&self) -> usize {
        self.occupancy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy.is_empty()
    }

    /// Occupancy of a species as a count. Out-of-range indices read as 0.
    pub fn count(&self, species: usize) -> i64 {
        self.occupancy.get(species).copied().unwrap_or(0)
    }

    /// Occupancy of a species as a measure value.
    pub fn occupancy(&self, species: usize) -> f64 {
        self.count(species) as f64
    }

    /// Total number of individuals across all species.
    pub fn population(&self) -> i64 {
        self.occupancy.iter().sum()
    }

    /// Returns a new state with the given per-species deltas applied.
    pub fn apply(&self, deltas: &[(usize, i64)]) -> PopulationState {
        let mut occupancy = self.occupancy.clone();
        for &(species, delta) in deltas {
            if let Some(slot) = occupancy.get_mut(species) {
                *slot += delta;
            }
        }
        PopulationState { occupancy }
    }
}

impl fmt::Display for PopulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, count) in self.occupancy.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{count}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_produces_a_new_state() {
        let state = PopulationState::new(vec![99, 1, 0]);
        let next = state.apply(&[(0, -1), (1, 1)]);
        assert_eq!(state.count(0), 99);
        assert_eq!(next.count(0), 98);
        assert_eq!(next.count(1), 2);
        assert_eq!(next.population(), state.population());
    }

    #[test]
    fn out_of_range_indices_read_as_zero() {
        let state = PopulationState::new(vec![5]);
        assert_eq!(state.count(7), 0);
        assert_eq!(state.occupancy(7), 0.0);
    }
}
