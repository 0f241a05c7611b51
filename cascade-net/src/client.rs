//! Client for submitting campaigns to a master server.

use std::time::{Duration, Instant};

use tracing::debug;

use cascade_core::{CancelToken, ComputationResult, SimulationUnit};

use crate::NetworkError;
use crate::config::NetworkConfig;
use crate::endpoint::Endpoint;
use crate::transport::{Connection, TlsConfig};
use crate::wire::{Message, MessageCodec, NetworkTask};

/// One connection to a master, submitting campaigns and collecting their
/// reduced results.
pub struct Client {
    conn: Connection,
}

impl Client {
    pub async fn connect(
        endpoint: Endpoint,
        tls: Option<&TlsConfig>,
        config: &NetworkConfig,
    ) -> Result<Self, NetworkError> {
        let codec = MessageCodec::new(config.compression_threshold);
        let conn = Connection::connect(endpoint, tls, codec).await?;
        Ok(Self { conn })
    }

    /// Round-trip liveness probe.
    pub async fn ping(&mut self) -> Result<Duration, NetworkError> {
        let started = Instant::now();
        self.conn.send(&Message::Ping).await?;
        match self.conn.receive().await? {
            Some(Message::Pong) => Ok(started.elapsed()),
            Some(other) => Err(NetworkError::protocol(format!(
                "expected pong, got tag {:#04x}",
                other.tag()
            ))),
            None => Err(NetworkError::protocol("master closed during ping")),
        }
    }

    /// Submits a campaign and waits for its result.
    pub async fn submit(
        &mut self,
        unit: &SimulationUnit,
        replications: u32,
        seed: u64,
    ) -> Result<ComputationResult, NetworkError> {
        self.submit_cancellable(unit, replications, seed, &CancelToken::new())
            .await
    }

    /// Submits a campaign; cancelling the token asks the master to stop
    /// and still yields the partial result.
    pub async fn submit_cancellable(
        &mut self,
        unit: &SimulationUnit,
        replications: u32,
        seed: u64,
        cancel: &CancelToken,
    ) -> Result<ComputationResult, NetworkError> {
        let model_id = unit.model.id();
        self.conn
            .send(&Message::Submit(NetworkTask {
                model: model_id,
                initial: unit.initial.clone(),
                sampling: unit.sampling.clone(),
                deadline: unit.deadline,
                seed,
                first_replication: 0,
                replications,
            }))
            .await?;

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                received = self.conn.receive() => match received? {
                    Some(Message::ModelRequest(id)) => {
                        if id != model_id {
                            return Err(NetworkError::protocol(format!(
                                "master requested model {id}, submitted {model_id}"
                            )));
                        }
                        debug!(model = %id, "uploading model to master");
                        self.conn
                            .send(&Message::ModelResponse(unit.model.clone()))
                            .await?;
                    }
                    Some(Message::Result(result)) => return Ok(result),
                    Some(other) => {
                        return Err(NetworkError::protocol(format!(
                            "unexpected message from master: tag {:#04x}",
                            other.tag()
                        )));
                    }
                    None => {
                        return Err(NetworkError::protocol(
                            "master closed connection before result",
                        ));
                    }
                },
                _ = wait_cancelled(cancel), if !cancel_sent => {
                    self.conn.send(&Message::Cancel).await?;
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
