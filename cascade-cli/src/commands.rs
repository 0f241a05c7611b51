//! CLI command implementations

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};

use cascade_core::{
    Measure, ModelSpec, PopulationState, SampleSet, SimulationConfig, SimulationManager,
    SimulationMonitor, SimulationUnit,
};
use cascade_net::{
    Client, DiscoveryListener, Endpoint, MasterCoordinator, MasterServer, MessageCodec,
    NetworkConfig, RemoteExecutor, SlaveRegistry, SlaveServer, TlsConfig, TlsPaths,
};

use crate::demo;

/// A model together with its starting state, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub model: ModelSpec,
    pub initial: PopulationState,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a campaign on this machine
    Run {
        #[command(flatten)]
        scenario: ScenarioArgs,
        #[command(flatten)]
        campaign: CampaignArgs,
        /// Worker threads (defaults to available cores)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Start a master node: discovers slaves and accepts submissions
    Master {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        /// Port clients submit campaigns to
        #[arg(short, long, default_value = "9852")]
        port: u16,
        /// UDP port slave announcements arrive on
        #[arg(long, default_value = "9851")]
        discovery_port: u16,
        #[command(flatten)]
        tls: TlsArgs,
    },
    /// Start a slave node: executes batches for a master
    Slave {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        /// Port the master dispatches tasks to
        #[arg(short, long, default_value = "9850")]
        port: u16,
        /// Address announcements are sent to
        #[arg(long, default_value = "255.255.255.255:9851")]
        discovery: SocketAddr,
        /// Worker threads (defaults to available cores)
        #[arg(short, long)]
        workers: Option<usize>,
        #[command(flatten)]
        tls: TlsArgs,
    },
    /// Submit a campaign to a running master
    Submit {
        /// Master endpoint, e.g. tcp://10.0.0.5:9852
        master: Endpoint,
        #[command(flatten)]
        scenario: ScenarioArgs,
        #[command(flatten)]
        campaign: CampaignArgs,
        #[command(flatten)]
        tls: TlsArgs,
    },
}

/// Which model to simulate.
#[derive(Args)]
pub struct ScenarioArgs {
    /// Scenario JSON file: {"model": ..., "initial": ...}
    #[arg(long, conflicts_with = "demo")]
    model: Option<PathBuf>,

    /// Built-in demo scenario
    #[arg(long, default_value = "sir", value_parser = ["sir", "seir"])]
    demo: String,
}

impl ScenarioArgs {
    fn load(&self) -> anyhow::Result<Scenario> {
        let scenario = match &self.model {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("malformed scenario in {}", path.display()))?
            }
            None => match self.demo.as_str() {
                "seir" => demo::seir(),
                _ => demo::sir(),
            },
        };
        scenario
            .model
            .validate()
            .context("scenario model failed validation")?;
        if scenario.initial.len() != scenario.model.species.len() {
            bail!(
                "initial state has {} species, model declares {}",
                scenario.initial.len(),
                scenario.model.species.len()
            );
        }
        Ok(scenario)
    }
}

/// How much to simulate and what to observe.
#[derive(Args)]
pub struct CampaignArgs {
    /// Number of independent replications
    #[arg(short, long, default_value = "100")]
    replications: u32,

    /// Simulated time horizon
    #[arg(short, long, default_value = "120.0")]
    deadline: f64,

    /// Number of grid points statistics are collected on
    #[arg(long, default_value = "100")]
    samples: usize,

    /// Campaign seed; replication i is deterministic given (seed, i)
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Species to observe (repeatable; defaults to every species)
    #[arg(short, long)]
    measure: Vec<String>,
}

impl CampaignArgs {
    fn build_unit(&self, scenario: &Scenario) -> anyhow::Result<SimulationUnit> {
        if self.deadline <= 0.0 || !self.deadline.is_finite() {
            bail!("deadline must be a positive number");
        }
        if self.samples == 0 {
            bail!("at least one sample point is required");
        }

        let species = &scenario.model.species;
        let measures: Vec<Measure> = if self.measure.is_empty() {
            species
                .iter()
                .enumerate()
                .map(|(i, name)| Measure::new(name.clone(), i))
                .collect()
        } else {
            self.measure
                .iter()
                .map(|name| {
                    species
                        .iter()
                        .position(|s| s == name)
                        .map(|i| Measure::new(name.clone(), i))
                        .with_context(|| format!("model has no species named '{name}'"))
                })
                .collect::<anyhow::Result<_>>()?
        };

        Ok(SimulationUnit::new(
            scenario.model.clone(),
            scenario.initial.clone(),
            SampleSet::grid(self.samples, self.deadline, measures),
            self.deadline,
        ))
    }
}

/// TLS material; all three paths must be given together.
#[derive(Args)]
pub struct TlsArgs {
    /// CA certificate (PEM)
    #[arg(long, requires = "tls_cert", requires = "tls_key")]
    tls_ca: Option<PathBuf>,

    /// Certificate chain (PEM)
    #[arg(long, requires = "tls_ca", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Private key (PEM)
    #[arg(long, requires = "tls_ca", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

impl TlsArgs {
    fn load(&self) -> anyhow::Result<(Option<TlsConfig>, Option<TlsPaths>)> {
        match (&self.tls_ca, &self.tls_cert, &self.tls_key) {
            (Some(ca), Some(cert), Some(key)) => {
                let paths = TlsPaths {
                    ca_certificate: ca.clone(),
                    certificate_chain: cert.clone(),
                    private_key: key.clone(),
                };
                let config = TlsConfig::from_paths(&paths).context("loading TLS material")?;
                Ok((Some(config), Some(paths)))
            }
            (None, None, None) => Ok((None, None)),
            _ => bail!("--tls-ca, --tls-cert and --tls-key must be given together"),
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the underlying simulation or network error of the command
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            scenario,
            campaign,
            workers,
        } => run_local(scenario, campaign, workers).await,
        Commands::Master {
            host,
            port,
            discovery_port,
            tls,
        } => start_master(host, port, discovery_port, tls).await,
        Commands::Slave {
            host,
            port,
            discovery,
            workers,
            tls,
        } => start_slave(host, port, discovery, workers, tls).await,
        Commands::Submit {
            master,
            scenario,
            campaign,
            tls,
        } => submit(master, scenario, campaign, tls).await,
    }
}

/// Run a campaign on the local worker pool
async fn run_local(
    scenario: ScenarioArgs,
    campaign: CampaignArgs,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let scenario = scenario.load()?;
    let unit = campaign.build_unit(&scenario)?;

    let mut config = SimulationConfig::default();
    if let Some(workers) = workers {
        config.workers = workers.max(1);
    }
    println!(
        "Running {} replications of '{}' on {} workers",
        campaign.replications, scenario.model.name, config.workers
    );

    let manager = SimulationManager::from_config(&config);
    let (monitor, _progress) = SimulationMonitor::new(campaign.replications);
    let report = manager
        .run(unit, campaign.replications, campaign.seed, &monitor)
        .await?;

    println!(
        "Completed {} replications ({} failed) in {:.2?}",
        report.completed, report.failed, report.elapsed
    );
    print_samples(&report.samples);
    Ok(())
}

/// Start a master node
async fn start_master(
    host: IpAddr,
    port: u16,
    discovery_port: u16,
    tls: TlsArgs,
) -> anyhow::Result<()> {
    let (tls, tls_paths) = tls.load()?;
    let config = NetworkConfig {
        slave_port: port,
        discovery_port,
        tls: tls_paths,
        ..NetworkConfig::default()
    };

    let registry = SlaveRegistry::new(config.liveness_timeout, config.strike_limit);
    let listener = DiscoveryListener::bind(
        SocketAddr::new(host, discovery_port),
        registry.clone(),
        MessageCodec::new(config.compression_threshold),
    )
    .await?;
    println!("Discovery listening on {}", listener.local_addr()?);
    tokio::spawn(listener.run());

    let executor = Arc::new(RemoteExecutor::new(registry, tls.clone(), &config));
    let coordinator = MasterCoordinator::new(executor, &config);
    let server = MasterServer::bind(SocketAddr::new(host, port), tls, coordinator, &config).await?;
    println!("Master accepting submissions on {}", server.local_addr()?);

    server.run().await?;
    Ok(())
}

/// Start a slave node
async fn start_slave(
    host: IpAddr,
    port: u16,
    discovery: SocketAddr,
    workers: Option<usize>,
    tls: TlsArgs,
) -> anyhow::Result<()> {
    let (tls, tls_paths) = tls.load()?;
    let config = NetworkConfig {
        slave_port: port,
        tls: tls_paths,
        ..NetworkConfig::default()
    };
    let workers = workers.unwrap_or_else(|| SimulationConfig::default().workers);

    let server = SlaveServer::bind(SocketAddr::new(host, port), workers, tls, &config).await?;
    println!(
        "Slave serving at {} with {workers} workers, announcing to {discovery}",
        server.endpoint()
    );
    let handle = server.spawn_discoverable(discovery).await?;

    tokio::signal::ctrl_c().await?;
    println!("Shutting down, draining running batches...");
    handle.shutdown().await;
    Ok(())
}

/// Submit a campaign to a master
async fn submit(
    master: Endpoint,
    scenario: ScenarioArgs,
    campaign: CampaignArgs,
    tls: TlsArgs,
) -> anyhow::Result<()> {
    let scenario = scenario.load()?;
    let unit = campaign.build_unit(&scenario)?;
    let (tls, _) = tls.load()?;
    let config = NetworkConfig::default();

    let mut client = Client::connect(master, tls.as_ref(), &config)
        .await
        .with_context(|| format!("connecting to master {master}"))?;
    let rtt = client.ping().await?;
    println!("Connected to {master} (rtt {rtt:.2?})");

    println!(
        "Submitting {} replications of '{}'",
        campaign.replications, scenario.model.name
    );
    let result = client
        .submit(&unit, campaign.replications, campaign.seed)
        .await?;

    println!(
        "Completed {} replications ({} failed) in {}ms",
        result.completed, result.failed, result.elapsed_ms
    );
    if let Some(error) = &result.error {
        println!("Reported error: {error}");
    }
    print_samples(&result.samples);
    Ok(())
}

/// Print each measure's time series as a table
fn print_samples(samples: &SampleSet) {
    for sampling in samples.samplings() {
        println!();
        println!("measure: {}", sampling.name());
        println!("{:>10}  {:>12}  {:>12}", "time", "mean", "std dev");
        for (time, mean, std_dev) in sampling.time_series() {
            println!("{time:>10.2}  {mean:>12.4}  {std_dev:>12.4}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn scenario_args(model: Option<PathBuf>, demo: &str) -> ScenarioArgs {
        ScenarioArgs {
            model,
            demo: demo.to_string(),
        }
    }

    fn campaign_args(measure: Vec<String>) -> CampaignArgs {
        CampaignArgs {
            replications: 10,
            deadline: 60.0,
            samples: 20,
            seed: 1,
            measure,
        }
    }

    #[test]
    fn demo_scenario_builds_a_unit() {
        let scenario = scenario_args(None, "sir").load().unwrap();
        let unit = campaign_args(vec![]).build_unit(&scenario).unwrap();
        // Default measures cover every species.
        assert_eq!(unit.sampling.samplings().len(), 3);
        assert_eq!(unit.deadline, 60.0);
    }

    #[test]
    fn scenario_file_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&demo::seir()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let scenario = scenario_args(Some(file.path().to_path_buf()), "sir")
            .load()
            .unwrap();
        assert_eq!(scenario.model.name, "seir");
    }

    #[test]
    fn unknown_measure_is_rejected() {
        let scenario = scenario_args(None, "sir").load().unwrap();
        let err = campaign_args(vec!["X".to_string()])
            .build_unit(&scenario)
            .unwrap_err();
        assert!(err.to_string().contains("no species named"));
    }

    #[test]
    fn malformed_scenario_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"model\": 3}").unwrap();
        assert!(
            scenario_args(Some(file.path().to_path_buf()), "sir")
                .load()
                .is_err()
        );
    }
}
