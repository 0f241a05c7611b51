//! Tunable parameters for the simulation core.
//!
//! All scheduler knobs live here to avoid hard-coded values scattered
//! through the codebase.

/// Configuration of the local scheduler and executors.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Worker threads for the threaded executor.
    pub workers: usize,
    /// How many lost batches a campaign re-dispatches before the
    /// remaining replications are reported failed.
    pub max_retries: u32,
    /// Largest replication batch handed to a single worker.
    pub max_batch: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            max_retries: 3,
            max_batch: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SimulationConfig::default();
        assert!(config.workers >= 1);
        assert!(config.max_retries > 0);
        assert!(config.max_batch >= 1);
    }
}
