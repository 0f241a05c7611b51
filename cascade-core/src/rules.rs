//! Serializable population models: mass-action reaction rule sets.
//!
//! A [`ModelSpec`] is the shippable form of a model: the complete rule set
//! as data, interpreted by the receiver. Specs are content-addressed by
//! the SHA-1 of their canonical serialization, so two versions of a model
//! sharing a name remain distinct identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::SimulationError;
use crate::model::PopulationModel;
use crate::population::PopulationState;
use crate::weighted::WeightedTree;

/// Content-addressed identity of a model specification.
///
/// 20-byte SHA-1 of the spec's canonical JSON serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId([u8; 20]);

impl ModelId {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ModelId {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| SimulationError::InvalidModel {
            reason: format!("malformed model id: {s}"),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| SimulationError::InvalidModel {
                reason: format!("model id must be 20 bytes: {s}"),
            })?;
        Ok(Self(hash))
    }
}

/// A species together with a multiplicity, as it appears in a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Population {
    pub species: usize,
    pub count: i64,
}

impl Population {
    pub fn new(species: usize) -> Self {
        Self { species, count: 1 }
    }

    pub fn with_count(species: usize, count: i64) -> Self {
        Self { species, count }
    }
}

/// One mass-action reaction: reactants are consumed, products created.
///
/// The rule is enabled when every reactant species holds at least its
/// required multiplicity; its propensity is the rate constant times the
/// falling product of reactant occupancies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRule {
    pub name: String,
    pub reactants: Vec<Population>,
    pub products: Vec<Population>,
    pub rate: f64,
}

impl ReactionRule {
    pub fn new(
        name: impl Into<String>,
        reactants: Vec<Population>,
        products: Vec<Population>,
        rate: f64,
    ) -> Self {
        Self {
            name: name.into(),
            reactants,
            products,
            rate,
        }
    }

    /// Rate of this rule in the given state; 0 when not enabled.
    pub fn propensity(&self, state: &PopulationState) -> f64 {
        let mut propensity = self.rate;
        for reactant in &self.reactants {
            let available = state.count(reactant.species);
            if available < reactant.count {
                return 0.0;
            }
            for k in 0..reactant.count {
                propensity *= (available - k) as f64;
            }
        }
        propensity
    }

    /// Net per-species population change of firing this rule once.
    fn deltas(&self) -> Vec<(usize, i64)> {
        let mut deltas = Vec::with_capacity(self.reactants.len() + self.products.len());
        for reactant in &self.reactants {
            deltas.push((reactant.species, -reactant.count));
        }
        for product in &self.products {
            deltas.push((product.species, product.count));
        }
        deltas
    }
}

/// A complete, serializable population model: species plus reaction rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub species: Vec<String>,
    pub rules: Vec<ReactionRule>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, species: Vec<String>, rules: Vec<ReactionRule>) -> Self {
        Self {
            name: name.into(),
            species,
            rules,
        }
    }

    /// Content-addressed identity of this spec.
    pub fn id(&self) -> ModelId {
        let canonical = serde_json::to_vec(self).expect("model spec serialization is infallible");
        let digest = Sha1::digest(&canonical);
        ModelId::new(digest.into())
    }

    /// Checks structural well-formedness: species indices in range, rates
    /// finite and non-negative, multiplicities positive.
    ///
    /// # Errors
    /// - `SimulationError::InvalidModel` - first violated constraint
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.species.is_empty() {
            return Err(SimulationError::InvalidModel {
                reason: "model declares no species".to_string(),
            });
        }
        for rule in &self.rules {
            if !rule.rate.is_finite() || rule.rate < 0.0 {
                return Err(SimulationError::InvalidModel {
                    reason: format!("rule '{}' has invalid rate {}", rule.name, rule.rate),
                });
            }
            for population in rule.reactants.iter().chain(rule.products.iter()) {
                if population.species >= self.species.len() {
                    return Err(SimulationError::InvalidModel {
                        reason: format!(
                            "rule '{}' references species {} out of {}",
                            rule.name,
                            population.species,
                            self.species.len()
                        ),
                    });
                }
                if population.count <= 0 {
                    return Err(SimulationError::InvalidModel {
                        reason: format!(
                            "rule '{}' has non-positive multiplicity {}",
                            rule.name, population.count
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

impl PopulationModel for ModelSpec {
    fn transitions(&self, state: &PopulationState) -> WeightedTree<usize> {
        let mut tree = WeightedTree::with_capacity(self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            let propensity = rule.propensity(state);
            if propensity > 0.0 {
                // Validated rates are finite and non-negative, and so are
                // the propensities derived from them.
                let _ = tree.add(propensity, index);
            }
        }
        tree
    }

    fn apply(&self, transition: usize, state: &PopulationState) -> PopulationState {
        match self.rules.get(transition) {
            Some(rule) => state.apply(&rule.deltas()),
            None => state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::weighted::WeightedStructure;

    use super::*;

    fn sir() -> ModelSpec {
        ModelSpec::new(
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
        )
    }

    #[test]
    fn propensity_follows_mass_action() {
        let model = sir();
        let state = PopulationState::new(vec![99, 1, 0]);
        assert!((model.rules[0].propensity(&state) - 0.004 * 99.0).abs() < 1e-12);
        assert!((model.rules[1].propensity(&state) - 1.0 / 15.0).abs() < 1e-12);
    }

    #[test]
    fn disabled_rules_have_zero_propensity() {
        let model = sir();
        let no_infected = PopulationState::new(vec![100, 0, 0]);
        assert_eq!(model.rules[0].propensity(&no_infected), 0.0);
        assert_eq!(model.rules[1].propensity(&no_infected), 0.0);
        assert!(model.transitions(&no_infected).is_empty());
    }

    #[test]
    fn pairwise_reactants_use_falling_products() {
        let dimer = ModelSpec::new(
            "dimer",
            vec!["A".into(), "B".into()],
            vec![ReactionRule::new(
                "2A->B",
                vec![Population::with_count(0, 2)],
                vec![Population::new(1)],
                0.5,
            )],
        );
        let state = PopulationState::new(vec![4, 0]);
        assert!((dimer.rules[0].propensity(&state) - 0.5 * 4.0 * 3.0).abs() < 1e-12);

        let next = dimer.apply(0, &state);
        assert_eq!(next, PopulationState::new(vec![2, 1]));
    }

    #[test]
    fn transitions_carry_propensities_as_weights() {
        let model = sir();
        let state = PopulationState::new(vec![99, 1, 0]);
        let tree = model.transitions(&state);
        assert_eq!(tree.len(), 2);
        let expected = 0.004 * 99.0 + 1.0 / 15.0;
        assert!((tree.total_weight() - expected).abs() < 1e-12);
    }

    #[test]
    fn ids_are_content_addressed() {
        let a = sir();
        let mut b = sir();
        assert_eq!(a.id(), b.id());

        b.rules[0].rate = 0.005;
        assert_ne!(a.id(), b.id());

        let shown = a.id().to_string();
        assert_eq!(shown.len(), 40);
        assert_eq!(shown.parse::<ModelId>().unwrap(), a.id());
    }

    #[test]
    fn validate_rejects_malformed_specs() {
        let mut bad = sir();
        bad.rules[0].rate = f64::NAN;
        assert!(bad.validate().is_err());

        let mut out_of_range = sir();
        out_of_range.rules[1].products[0].species = 9;
        assert!(out_of_range.validate().is_err());

        assert!(sir().validate().is_ok());
    }
}
