//! Master side: remote batch dispatch and campaign coordination.
//!
//! [`RemoteExecutor`] plugs the discovered slave pool into the core
//! scheduler: each batch travels to the least-loaded idle slave over a
//! fresh connection, model specs are served on demand, and a slave that
//! fails a dispatch accumulates strikes until it is dropped. The
//! [`MasterCoordinator`] runs campaigns against that executor and tracks
//! their progress; [`MasterServer`] exposes submission over the same
//! wire protocol for remote clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cascade_core::{
    Batch, CampaignReport, CancelToken, ComputationResult, Progress, ReplicationExecutor,
    SimulationError, SimulationManager, SimulationMonitor, SimulationUnit,
};

use crate::NetworkError;
use crate::config::NetworkConfig;
use crate::discovery::SlaveRegistry;
use crate::endpoint::Endpoint;
use crate::registry::ModelRegistry;
use crate::transport::{Connection, Listener, TlsConfig};
use crate::wire::{Message, MessageCodec, NetworkTask};

pub type CampaignId = Uuid;

/// Executor dispatching batches to discovered slave servers.
pub struct RemoteExecutor {
    slaves: SlaveRegistry,
    tls: Option<TlsConfig>,
    codec: MessageCodec,
    max_batch: u32,
}

impl RemoteExecutor {
    pub fn new(slaves: SlaveRegistry, tls: Option<TlsConfig>, config: &NetworkConfig) -> Self {
        Self {
            slaves,
            tls,
            codec: MessageCodec::new(config.compression_threshold),
            max_batch: config.max_batch.max(1),
        }
    }

    pub fn slaves(&self) -> &SlaveRegistry {
        &self.slaves
    }

    /// Waits until an idle slave exists or the batch is cancelled.
    async fn acquire_slave(&self, cancel: &CancelToken) -> Option<Endpoint> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(slave) = self.slaves.select_idle() {
                self.slaves.mark_busy(slave);
                return Some(slave);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Sends one batch to `slave` and waits for its result, answering
    /// model requests and relaying cancellation along the way.
    async fn dispatch(
        &self,
        slave: Endpoint,
        batch: &Batch,
    ) -> Result<ComputationResult, NetworkError> {
        let mut conn = Connection::connect(slave, self.tls.as_ref(), self.codec.clone()).await?;
        let model_id = batch.unit.model.id();
        conn.send(&Message::Submit(NetworkTask {
            model: model_id,
            initial: batch.unit.initial.clone(),
            sampling: batch.unit.sampling.clone(),
            deadline: batch.unit.deadline,
            seed: batch.seed,
            first_replication: batch.first_replication,
            replications: batch.count,
        }))
        .await?;

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                received = conn.receive() => match received? {
                    Some(Message::ModelRequest(id)) => {
                        if id != model_id {
                            return Err(NetworkError::protocol(format!(
                                "slave requested model {id}, dispatched {model_id}"
                            )));
                        }
                        debug!(slave = %slave, model = %id, "serving model");
                        conn.send(&Message::ModelResponse(batch.unit.model.clone()))
                            .await?;
                    }
                    Some(Message::Result(result)) => return Ok(result),
                    Some(other) => {
                        return Err(NetworkError::protocol(format!(
                            "unexpected message from slave: tag {:#04x}",
                            other.tag()
                        )));
                    }
                    None => {
                        return Err(NetworkError::protocol(
                            "slave closed connection before result",
                        ));
                    }
                },
                _ = wait_cancelled(&batch.cancel), if !cancel_sent => {
                    debug!(slave = %slave, "relaying cancellation");
                    conn.send(&Message::Cancel).await?;
                    cancel_sent = true;
                }
            }
        }
    }
}

async fn wait_cancelled(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[async_trait]
impl ReplicationExecutor for RemoteExecutor {
    fn capacity(&self) -> usize {
        self.slaves.live_count()
    }

    fn max_batch(&self) -> u32 {
        self.max_batch
    }

    async fn execute(&self, batch: Batch) -> Result<ComputationResult, SimulationError> {
        let Some(slave) = self.acquire_slave(&batch.cancel).await else {
            // Cancelled while waiting for capacity: nothing ran.
            return Ok(ComputationResult {
                samples: batch.unit.sampling.clone(),
                completed: 0,
                failed: 0,
                origin: None,
                elapsed_ms: 0,
                error: None,
            });
        };

        match self.dispatch(slave, &batch).await {
            Ok(result) => {
                self.slaves.mark_idle(slave);
                Ok(result)
            }
            Err(err) => {
                warn!(slave = %slave, error = %err, "dispatch failed");
                self.slaves.strike(slave);
                Err(SimulationError::Executor {
                    reason: format!("dispatch to {slave} failed: {err}"),
                })
            }
        }
    }
}

/// Terminal or running state of a submitted campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
enum Outcome {
    Report(CampaignReport),
    Failed(String),
}

struct Campaign {
    monitor: SimulationMonitor,
    progress: watch::Receiver<Progress>,
    outcome: watch::Receiver<Option<Outcome>>,
}

/// Runs campaigns against one executor and tracks their lifecycles.
///
/// Cloneable; all clones share the campaign table.
#[derive(Clone)]
pub struct MasterCoordinator {
    executor: Arc<dyn ReplicationExecutor>,
    campaigns: Arc<RwLock<HashMap<CampaignId, Campaign>>>,
    max_campaigns: usize,
    max_retries: u32,
}

impl MasterCoordinator {
    pub fn new(executor: Arc<dyn ReplicationExecutor>, config: &NetworkConfig) -> Self {
        Self {
            executor,
            campaigns: Arc::new(RwLock::new(HashMap::new())),
            max_campaigns: config.max_campaigns.max(1),
            max_retries: config.max_retries,
        }
    }

    /// Number of campaigns still running.
    pub fn running_campaigns(&self) -> usize {
        self.campaigns
            .read()
            .values()
            .filter(|c| c.outcome.borrow().is_none())
            .count()
    }

    /// Starts a campaign of `replications` replications of `unit`.
    ///
    /// # Errors
    /// - `NetworkError::Busy` - the running-campaign limit is reached
    pub fn submit(
        &self,
        unit: SimulationUnit,
        replications: u32,
        seed: u64,
    ) -> Result<CampaignId, NetworkError> {
        if self.running_campaigns() >= self.max_campaigns {
            return Err(NetworkError::Busy);
        }

        let id = Uuid::new_v4();
        let (monitor, progress) = SimulationMonitor::new(replications);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let manager =
            SimulationManager::with_executor(self.executor.clone()).max_retries(self.max_retries);
        let run_monitor = monitor.clone();
        tokio::spawn(async move {
            info!(campaign = %id, replications, "campaign started");
            let outcome = match manager.run(unit, replications, seed, &run_monitor).await {
                Ok(report) => {
                    info!(
                        campaign = %id,
                        completed = report.completed,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        "campaign finished"
                    );
                    Outcome::Report(report)
                }
                Err(err) => {
                    warn!(campaign = %id, error = %err, "campaign failed");
                    Outcome::Failed(err.to_string())
                }
            };
            let _ = outcome_tx.send(Some(outcome));
        });

        self.campaigns.write().insert(
            id,
            Campaign {
                monitor,
                progress,
                outcome: outcome_rx,
            },
        );
        Ok(id)
    }

    /// # Errors
    /// - `NetworkError::UnknownCampaign` - no campaign with this id
    pub fn status(&self, id: CampaignId) -> Result<CampaignStatus, NetworkError> {
        let campaigns = self.campaigns.read();
        let campaign = campaigns
            .get(&id)
            .ok_or(NetworkError::UnknownCampaign { id })?;
        let status = match &*campaign.outcome.borrow() {
            None => CampaignStatus::Running,
            Some(Outcome::Report(report)) if report.cancelled => CampaignStatus::Cancelled,
            Some(Outcome::Report(_)) => CampaignStatus::Completed,
            Some(Outcome::Failed(_)) => CampaignStatus::Failed,
        };
        Ok(status)
    }

    /// Live progress feed of a campaign.
    pub fn progress(&self, id: CampaignId) -> Result<watch::Receiver<Progress>, NetworkError> {
        self.campaigns
            .read()
            .get(&id)
            .map(|c| c.progress.clone())
            .ok_or(NetworkError::UnknownCampaign { id })
    }

    /// Requests cancellation; the campaign still produces a (partial)
    /// report.
    pub fn cancel(&self, id: CampaignId) -> Result<(), NetworkError> {
        self.campaigns
            .read()
            .get(&id)
            .map(|c| c.monitor.cancel())
            .ok_or(NetworkError::UnknownCampaign { id })
    }

    /// Waits for a campaign to finish and returns its report.
    ///
    /// # Errors
    /// - `NetworkError::UnknownCampaign` - no campaign with this id
    /// - `NetworkError::Simulation` - the campaign failed outright
    pub async fn await_report(&self, id: CampaignId) -> Result<CampaignReport, NetworkError> {
        let mut outcome = self
            .campaigns
            .read()
            .get(&id)
            .map(|c| c.outcome.clone())
            .ok_or(NetworkError::UnknownCampaign { id })?;

        loop {
            if let Some(outcome) = &*outcome.borrow_and_update() {
                return match outcome {
                    Outcome::Report(report) => Ok(report.clone()),
                    Outcome::Failed(reason) => Err(NetworkError::Simulation(
                        SimulationError::Executor {
                            reason: reason.clone(),
                        },
                    )),
                };
            }
            if outcome.changed().await.is_err() {
                return Err(NetworkError::protocol("campaign task dropped its outcome"));
            }
        }
    }

    /// Drops finished campaigns from the table.
    pub fn prune(&self) {
        self.campaigns
            .write()
            .retain(|_, c| c.outcome.borrow().is_none());
    }
}

/// Accepts client connections and runs their submissions as campaigns.
///
/// Speaks the same protocol as the slave side, reversed: the client
/// submits a task, the master fetches the model from the client when it
/// has not seen it, and answers with the campaign's reduced result.
pub struct MasterServer {
    listener: Listener,
    coordinator: MasterCoordinator,
    models: ModelRegistry,
}

impl MasterServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsConfig>,
        coordinator: MasterCoordinator,
        config: &NetworkConfig,
    ) -> Result<Self, NetworkError> {
        let codec = MessageCodec::new(config.compression_threshold);
        let listener = Listener::bind(addr, tls, codec).await?;
        Ok(Self {
            listener,
            coordinator,
            models: ModelRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Accepts and serves clients forever.
    pub async fn run(self) -> Result<(), NetworkError> {
        info!(addr = %self.listener.local_addr()?, "master serving");
        loop {
            let conn = self.listener.accept().await?;
            let coordinator = self.coordinator.clone();
            let models = self.models.clone();
            tokio::spawn(async move {
                let peer = conn.peer_addr();
                if let Err(err) = serve_client(conn, coordinator, models).await {
                    debug!(peer = %peer, error = %err, "client connection ended");
                }
            });
        }
    }
}

async fn serve_client(
    mut conn: Connection,
    coordinator: MasterCoordinator,
    models: ModelRegistry,
) -> Result<(), NetworkError> {
    while let Some(message) = conn.receive().await? {
        match message {
            Message::Ping => conn.send(&Message::Pong).await?,
            Message::Submit(task) => {
                if !run_submission(&mut conn, task, &coordinator, &models).await? {
                    return Ok(());
                }
            }
            Message::Cancel => {}
            other => {
                return Err(NetworkError::protocol(format!(
                    "unexpected message on client connection: tag {:#04x}",
                    other.tag()
                )));
            }
        }
    }
    Ok(())
}

/// Fetches the model from the client when unknown.
async fn client_model(
    conn: &mut Connection,
    models: &ModelRegistry,
    id: cascade_core::ModelId,
) -> Result<Arc<cascade_core::ModelSpec>, NetworkError> {
    if let Ok(spec) = models.resolve(id) {
        return Ok(spec);
    }
    conn.send(&Message::ModelRequest(id)).await?;
    match conn.receive().await? {
        Some(Message::ModelResponse(spec)) => {
            if spec.id() != id {
                return Err(NetworkError::protocol(format!(
                    "model response {} does not match requested {id}",
                    spec.id()
                )));
            }
            models.load(spec)?;
            models.resolve(id)
        }
        Some(other) => Err(NetworkError::protocol(format!(
            "expected model response, got tag {:#04x}",
            other.tag()
        ))),
        None => Err(NetworkError::protocol(
            "connection closed during model transfer",
        )),
    }
}

/// Runs one submitted campaign to completion on behalf of a client.
/// Returns whether the connection is still usable.
async fn run_submission(
    conn: &mut Connection,
    task: NetworkTask,
    coordinator: &MasterCoordinator,
    models: &ModelRegistry,
) -> Result<bool, NetworkError> {
    let spec = client_model(conn, models, task.model).await?;
    let unit = SimulationUnit::new(
        (*spec).clone(),
        task.initial,
        task.sampling.clone(),
        task.deadline,
    );

    let id = match coordinator.submit(unit, task.replications, task.seed) {
        Ok(id) => id,
        Err(NetworkError::Busy) => {
            // Capacity refusal travels inside the result envelope so the
            // client sees which replications never ran.
            conn.send(&Message::Result(ComputationResult {
                samples: task.sampling,
                completed: 0,
                failed: task.replications,
                origin: None,
                elapsed_ms: 0,
                error: Some("coordinator is at campaign capacity".to_string()),
            }))
            .await?;
            return Ok(true);
        }
        Err(err) => return Err(err),
    };

    let report = loop {
        tokio::select! {
            report = coordinator.await_report(id) => break report?,
            received = conn.receive() => match received {
                Ok(Some(Message::Cancel)) => {
                    coordinator.cancel(id)?;
                }
                Ok(Some(other)) => {
                    coordinator.cancel(id)?;
                    return Err(NetworkError::protocol(format!(
                        "unexpected message while campaign runs: tag {:#04x}",
                        other.tag()
                    )));
                }
                // A client that disappears takes its campaign with it.
                Ok(None) | Err(_) => {
                    coordinator.cancel(id)?;
                    return Ok(false);
                }
            },
        }
    };

    conn.send(&Message::Result(ComputationResult {
        samples: report.samples,
        completed: report.completed,
        failed: report.failed,
        origin: None,
        elapsed_ms: report.elapsed.as_millis().min(u64::MAX as u128) as u64,
        error: None,
    }))
    .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use cascade_core::{Measure, ModelSpec, Population, PopulationState, ReactionRule, SampleSet};

    use crate::slave::SlaveServer;

    fn decay_spec() -> ModelSpec {
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

    fn decay_unit() -> SimulationUnit {
        SimulationUnit::new(
            decay_spec(),
            PopulationState::new(vec![20, 0]),
            SampleSet::grid(10, 10.0, vec![Measure::new("A", 0)]),
            10.0,
        )
    }

    fn announcement(endpoint: Endpoint, free: usize) -> crate::discovery::Announcement {
        crate::discovery::Announcement {
            endpoint,
            free_capacity: free,
        }
    }

    async fn slave_pool(count: usize, config: &NetworkConfig) -> (Vec<crate::slave::SlaveHandle>, SlaveRegistry) {
        let registry = SlaveRegistry::new(config.liveness_timeout, config.strike_limit);
        let mut handles = Vec::new();
        for _ in 0..count {
            let server = SlaveServer::bind(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
                2,
                None,
                config,
            )
            .await
            .unwrap();
            registry.observe(announcement(server.endpoint(), 2));
            handles.push(server.spawn());
        }
        (handles, registry)
    }

    #[tokio::test]
    async fn remote_campaign_completes() {
        let config = NetworkConfig::default();
        let (slaves, registry) = slave_pool(2, &config).await;
        let executor = Arc::new(RemoteExecutor::new(registry, None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);

        let id = coordinator.submit(decay_unit(), 40, 11).unwrap();
        let report = coordinator.await_report(id).await.unwrap();
        assert_eq!(report.completed, 40);
        assert_eq!(report.failed, 0);
        assert_eq!(report.samples.samplings()[0].points()[0].count(), 40);
        assert_eq!(
            coordinator.status(id).unwrap(),
            CampaignStatus::Completed
        );

        for slave in slaves {
            slave.shutdown().await;
        }
    }

    #[tokio::test]
    async fn remote_matches_local_statistics() {
        let config = NetworkConfig::default();
        let (slaves, registry) = slave_pool(2, &config).await;
        let executor = Arc::new(RemoteExecutor::new(registry, None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);

        let replications = 30;
        let seed = 77;
        let id = coordinator.submit(decay_unit(), replications, seed).unwrap();
        let remote = coordinator.await_report(id).await.unwrap();

        let (monitor, _) = SimulationMonitor::new(replications);
        let local = SimulationManager::sequential()
            .run(decay_unit(), replications, seed, &monitor)
            .await
            .unwrap();

        let a = remote.samples.samplings()[0].time_series();
        let b = local.samples.samplings()[0].time_series();
        for ((_, mean_a, std_a), (_, mean_b, std_b)) in a.iter().zip(b.iter()) {
            assert!((mean_a - mean_b).abs() < 1e-9);
            assert!((std_a - std_b).abs() < 1e-9);
        }

        for slave in slaves {
            slave.shutdown().await;
        }
    }

    #[tokio::test]
    async fn dead_slave_is_struck_and_work_rerouted() {
        let mut config = NetworkConfig::default();
        config.strike_limit = 1;
        let (slaves, registry) = slave_pool(1, &config).await;

        // A registered endpoint nobody listens on; dispatches to it fail
        // with connection errors and the batch is requeued elsewhere.
        let ghost = Endpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        registry.observe(announcement(ghost, 64));

        let executor = Arc::new(RemoteExecutor::new(registry.clone(), None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);

        let id = coordinator.submit(decay_unit(), 40, 5).unwrap();
        let report = coordinator.await_report(id).await.unwrap();
        assert_eq!(report.completed + report.failed, 40);
        assert_eq!(report.completed, 40);
        assert!(registry.entry(ghost).is_none());

        for slave in slaves {
            slave.shutdown().await;
        }
    }

    #[tokio::test]
    async fn campaign_limit_refuses_with_busy() {
        let config = NetworkConfig {
            max_campaigns: 1,
            ..NetworkConfig::default()
        };
        let (slaves, registry) = slave_pool(1, &config).await;
        let executor = Arc::new(RemoteExecutor::new(registry, None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);

        let first = coordinator.submit(decay_unit(), 10_000, 1).unwrap();
        let second = coordinator.submit(decay_unit(), 10, 2);
        assert!(matches!(second, Err(NetworkError::Busy)));

        coordinator.cancel(first).unwrap();
        let _ = coordinator.await_report(first).await.unwrap();

        for slave in slaves {
            slave.shutdown().await;
        }
    }

    #[tokio::test]
    async fn cancelled_campaign_reports_partial_counts() {
        let config = NetworkConfig::default();
        let (slaves, registry) = slave_pool(1, &config).await;
        let executor = Arc::new(RemoteExecutor::new(registry, None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);

        let id = coordinator.submit(decay_unit(), 10_000, 9).unwrap();
        coordinator.cancel(id).unwrap();
        let report = coordinator.await_report(id).await.unwrap();
        assert!(report.cancelled);
        assert!(report.completed < 10_000);
        assert_eq!(coordinator.status(id).unwrap(), CampaignStatus::Cancelled);

        for slave in slaves {
            slave.shutdown().await;
        }
    }

    #[tokio::test]
    async fn unknown_campaign_is_an_error() {
        let config = NetworkConfig::default();
        let registry = SlaveRegistry::new(config.liveness_timeout, config.strike_limit);
        let executor = Arc::new(RemoteExecutor::new(registry, None, &config));
        let coordinator = MasterCoordinator::new(executor, &config);
        assert!(matches!(
            coordinator.status(Uuid::new_v4()),
            Err(NetworkError::UnknownCampaign { .. })
        ));
    }
}
