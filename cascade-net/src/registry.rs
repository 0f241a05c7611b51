//! Content-addressed store of model specifications.
//!
//! Both sides of the protocol hold one: the master registers every model
//! it submits so it can answer `ModelRequest`, a slave caches specs it
//! has fetched so repeated campaigns skip the transfer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cascade_core::{ModelId, ModelSpec};

use crate::NetworkError;

/// Thread-safe map from model identity to validated specification.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Arc<RwLock<HashMap<ModelId, Arc<ModelSpec>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a spec, returning its identity.
    ///
    /// # Errors
    /// - `NetworkError::Load` - the spec fails validation
    pub fn load(&self, spec: ModelSpec) -> Result<ModelId, NetworkError> {
        spec.validate().map_err(|err| NetworkError::Load {
            reason: err.to_string(),
        })?;
        let id = spec.id();
        self.models.write().insert(id, Arc::new(spec));
        Ok(id)
    }

    /// Looks up a spec by identity.
    ///
    /// # Errors
    /// - `NetworkError::UnknownModel` - no spec with this identity is loaded
    pub fn resolve(&self, id: ModelId) -> Result<Arc<ModelSpec>, NetworkError> {
        self.models
            .read()
            .get(&id)
            .cloned()
            .ok_or(NetworkError::UnknownModel { id })
    }

    pub fn contains(&self, id: ModelId) -> bool {
        self.models.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cascade_core::{Population, ReactionRule};

    fn decay() -> ModelSpec {
        ModelSpec::new(
            "decay",
            vec!["A".into(), "B".into()],
            vec![ReactionRule::new(
                "A->B",
                vec![Population::new(0)],
                vec![Population::new(1)],
                1.0,
            )],
        )
    }

    #[test]
    fn load_then_resolve() {
        let registry = ModelRegistry::new();
        let spec = decay();
        let id = registry.load(spec.clone()).unwrap();
        assert_eq!(id, spec.id());
        assert!(registry.contains(id));
        assert_eq!(registry.resolve(id).unwrap().name, "decay");
    }

    #[test]
    fn unknown_model_is_an_error() {
        let registry = ModelRegistry::new();
        let id = decay().id();
        assert!(matches!(
            registry.resolve(id),
            Err(NetworkError::UnknownModel { .. })
        ));
    }

    #[test]
    fn invalid_spec_is_rejected() {
        let registry = ModelRegistry::new();
        let mut bad = decay();
        bad.rules[0].rate = -1.0;
        assert!(matches!(
            registry.load(bad),
            Err(NetworkError::Load { .. })
        ));
        assert!(registry.is_empty());
    }
}
