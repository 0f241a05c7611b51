//! Shared scaffolding: a full master/slave stack on localhost.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use cascade_core::{
    Measure, ModelSpec, Population, PopulationState, ReactionRule, SampleSet, SimulationUnit,
};
use cascade_net::{
    DiscoveryListener, Endpoint, MasterCoordinator, MasterServer, MessageCodec, NetworkConfig,
    RemoteExecutor, SlaveHandle, SlaveRegistry, SlaveServer,
};

pub fn localhost() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// SIR outbreak scenario used across the integration suite.
pub fn sir_unit(deadline: f64, samples: usize) -> SimulationUnit {
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
    SimulationUnit::new(
        model,
        PopulationState::new(vec![95, 5, 0]),
        SampleSet::grid(samples, deadline, vec![Measure::new("I", 1)]),
        deadline,
    )
}

/// A running master with its discovery listener and a pool of
/// discoverable slaves, all on ephemeral localhost ports.
pub struct Stack {
    pub config: NetworkConfig,
    pub registry: SlaveRegistry,
    pub coordinator: MasterCoordinator,
    pub master: Endpoint,
    pub discovery_addr: SocketAddr,
    pub slaves: Vec<SlaveHandle>,
}

impl Stack {
    /// Fast announce/liveness intervals so discovery settles within a
    /// test-sized window.
    pub fn test_config() -> NetworkConfig {
        NetworkConfig {
            announce_interval: Duration::from_millis(50),
            liveness_timeout: Duration::from_millis(400),
            ..NetworkConfig::default()
        }
    }

    pub async fn start(slave_count: usize, workers: usize) -> Self {
        Self::start_with_config(slave_count, workers, Self::test_config()).await
    }

    pub async fn start_with_config(
        slave_count: usize,
        workers: usize,
        config: NetworkConfig,
    ) -> Self {
        let registry = SlaveRegistry::new(config.liveness_timeout, config.strike_limit);
        let codec = MessageCodec::new(config.compression_threshold);

        let listener = DiscoveryListener::bind(localhost(), registry.clone(), codec)
            .await
            .unwrap();
        let discovery_addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run());

        let mut slaves = Vec::new();
        for _ in 0..slave_count {
            slaves.push(spawn_slave(workers, discovery_addr, &config).await);
        }

        let executor = Arc::new(RemoteExecutor::new(registry.clone(), None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);
        let server = MasterServer::bind(localhost(), None, coordinator.clone(), &config)
            .await
            .unwrap();
        let master = Endpoint::from(server.local_addr().unwrap());
        tokio::spawn(server.run());

        let stack = Self {
            config,
            registry,
            coordinator,
            master,
            discovery_addr,
            slaves,
        };
        stack.await_slaves(slave_count).await;
        stack
    }

    /// Waits until discovery has seen at least `count` live slaves.
    pub async fn await_slaves(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.registry.live_count() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("discovery never reported {count} slaves"));
    }

    pub async fn shutdown(self) {
        for slave in self.slaves {
            slave.shutdown().await;
        }
    }
}

pub async fn spawn_slave(
    workers: usize,
    discovery_addr: SocketAddr,
    config: &NetworkConfig,
) -> SlaveHandle {
    let server = SlaveServer::bind(localhost(), workers, None, config)
        .await
        .unwrap();
    server.spawn_discoverable(discovery_addr).await.unwrap()
}
