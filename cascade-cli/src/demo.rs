//! Built-in epidemic models for quick experiments.

use cascade_core::{ModelSpec, Population, PopulationState, ReactionRule};

use crate::commands::Scenario;

/// Susceptible-infected-recovered with a small seeded outbreak.
pub fn sir() -> Scenario {
    let model = ModelSpec::new(
        "sir",
        vec!["S".into(), "I".into(), "R".into()],
        vec![
            ReactionRule::new(
                "infection",
                vec![Population::new(0), Population::new(1)],
                vec![Population::with_count(1, 2)],
                0.004,
            ),
            ReactionRule::new(
                "recovery",
                vec![Population::new(1)],
                vec![Population::new(2)],
                1.0 / 15.0,
            ),
        ],
    );
    Scenario {
        model,
        initial: PopulationState::new(vec![95, 5, 0]),
    }
}

/// SIR with an exposed-but-not-yet-infectious stage.
pub fn seir() -> Scenario {
    let model = ModelSpec::new(
        "seir",
        vec!["S".into(), "E".into(), "I".into(), "R".into()],
        vec![
            ReactionRule::new(
                "exposure",
                vec![Population::new(0), Population::new(2)],
                vec![Population::new(1), Population::new(2)],
                0.004,
            ),
            ReactionRule::new(
                "onset",
                vec![Population::new(1)],
                vec![Population::new(2)],
                1.0 / 5.0,
            ),
            ReactionRule::new(
                "recovery",
                vec![Population::new(2)],
                vec![Population::new(3)],
                1.0 / 15.0,
            ),
        ],
    );
    Scenario {
        model,
        initial: PopulationState::new(vec![93, 2, 5, 0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_scenarios_validate() {
        for scenario in [sir(), seir()] {
            scenario.model.validate().unwrap();
            assert_eq!(
                scenario.initial.population(),
                100,
                "{}",
                scenario.model.name
            );
            assert_eq!(scenario.initial.len(), scenario.model.species.len());
        }
    }
}
