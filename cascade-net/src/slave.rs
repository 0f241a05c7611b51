//! Slave server: accepts task connections and executes batches locally.
//!
//! A slave is stateless between campaigns. The master opens a connection
//! per dispatched batch; the slave resolves the model (fetching it over
//! the same connection on first sight), runs the replications on
//! blocking threads and answers with a result envelope. Losing the
//! connection cancels the batch, which the master recovers by
//! re-dispatching the slice elsewhere.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cascade_core::{CancelToken, ComputationResult, SimulationUnit, run_batch};

use crate::NetworkError;
use crate::config::NetworkConfig;
use crate::discovery::DiscoveryAnnouncer;
use crate::endpoint::Endpoint;
use crate::registry::ModelRegistry;
use crate::transport::{Connection, Listener, TlsConfig};
use crate::wire::{Message, MessageCodec, NetworkTask};

/// Lifecycle of a slave server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlavePhase {
    /// Accepting connections and executing batches.
    Serving,
    /// No longer accepting; running batches finish.
    Draining,
    Stopped,
}

struct SlaveContext {
    endpoint: Endpoint,
    registry: ModelRegistry,
    free_capacity: Arc<AtomicUsize>,
    workers: usize,
    shutdown: Arc<Notify>,
}

/// A bound slave server, ready to spawn.
pub struct SlaveServer {
    listener: Listener,
    endpoint: Endpoint,
    context: Arc<SlaveContext>,
    codec: MessageCodec,
    announce_interval: Duration,
}

impl SlaveServer {
    /// Binds the task listener at `addr` and prepares `workers`
    /// execution slots.
    pub async fn bind(
        addr: SocketAddr,
        workers: usize,
        tls: Option<TlsConfig>,
        config: &NetworkConfig,
    ) -> Result<Self, NetworkError> {
        let codec = MessageCodec::new(config.compression_threshold);
        let listener = Listener::bind(addr, tls.clone(), codec.clone()).await?;
        let local = listener.local_addr()?;
        let endpoint = Endpoint::new(
            local.ip(),
            local.port(),
            if tls.is_some() {
                crate::endpoint::TransportKind::Tls
            } else {
                crate::endpoint::TransportKind::Tcp
            },
        );
        let workers = workers.max(1);
        Ok(Self {
            listener,
            endpoint,
            context: Arc::new(SlaveContext {
                endpoint,
                registry: ModelRegistry::new(),
                free_capacity: Arc::new(AtomicUsize::new(workers)),
                workers,
                shutdown: Arc::new(Notify::new()),
            }),
            codec,
            announce_interval: config.announce_interval,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Starts serving. The returned handle controls shutdown.
    pub fn spawn(self) -> SlaveHandle {
        self.spawn_inner(None)
    }

    /// Starts serving and announcing to `discovery_target`.
    pub async fn spawn_discoverable(
        self,
        discovery_target: SocketAddr,
    ) -> Result<SlaveHandle, NetworkError> {
        let announcer = DiscoveryAnnouncer::bind(
            discovery_target,
            self.endpoint,
            self.context.free_capacity.clone(),
            self.announce_interval,
            self.codec.clone(),
        )
        .await?;
        Ok(self.spawn_inner(Some(announcer)))
    }

    fn spawn_inner(self, announcer: Option<DiscoveryAnnouncer>) -> SlaveHandle {
        let (phase_tx, phase_rx) = watch::channel(SlavePhase::Serving);
        let endpoint = self.endpoint;
        let context = self.context.clone();
        let shutdown = context.shutdown.clone();
        let free_capacity = context.free_capacity.clone();

        let announce_task = announcer.map(|a| {
            tokio::spawn(async move {
                if let Err(err) = a.run().await {
                    warn!(error = %err, "announcer stopped");
                }
            })
        });

        let task = tokio::spawn(async move {
            info!(slave = %endpoint, workers = context.workers, "slave serving");
            loop {
                tokio::select! {
                    _ = context.shutdown.notified() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok(conn) => {
                            let context = context.clone();
                            tokio::spawn(async move {
                                let peer = conn.peer_addr();
                                if let Err(err) = serve_connection(conn, &context).await {
                                    debug!(peer = %peer, error = %err, "connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    },
                }
            }

            // Close the listener so dispatches racing the shutdown fail
            // fast instead of sitting in the accept backlog.
            drop(self.listener);
            let _ = phase_tx.send(SlavePhase::Draining);
            info!(slave = %endpoint, "draining");
            while context.free_capacity.load(Ordering::SeqCst) < context.workers {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            let _ = phase_tx.send(SlavePhase::Stopped);
            info!(slave = %endpoint, "stopped");
        });

        SlaveHandle {
            endpoint,
            free_capacity,
            phase: phase_rx,
            shutdown,
            task,
            announce_task,
        }
    }
}

/// Control surface of a running slave.
pub struct SlaveHandle {
    endpoint: Endpoint,
    free_capacity: Arc<AtomicUsize>,
    phase: watch::Receiver<SlavePhase>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
    announce_task: Option<JoinHandle<()>>,
}

impl SlaveHandle {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn free_capacity(&self) -> usize {
        self.free_capacity.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SlavePhase {
        *self.phase.borrow()
    }

    /// Stops accepting, waits for running batches to finish, then stops.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(announce) = &self.announce_task {
            announce.abort();
        }
        // Phase reaches Stopped when the drain completes.
        while *self.phase.borrow() != SlavePhase::Stopped {
            if self.phase.changed().await.is_err() {
                break;
            }
        }
        let _ = self.task.await;
    }
}

async fn serve_connection(
    mut conn: Connection,
    context: &SlaveContext,
) -> Result<(), NetworkError> {
    while let Some(message) = conn.receive().await? {
        match message {
            Message::Ping => conn.send(&Message::Pong).await?,
            Message::Submit(task) => {
                if !execute_task(&mut conn, task, context).await? {
                    return Ok(());
                }
            }
            // A cancel with nothing running is stale; ignore it.
            Message::Cancel => {}
            Message::Shutdown => {
                context.shutdown.notify_one();
                return Ok(());
            }
            other => {
                return Err(NetworkError::protocol(format!(
                    "unexpected message on slave connection: tag {:#04x}",
                    other.tag()
                )));
            }
        }
    }
    Ok(())
}

/// Resolves the model, fetching it from the master on first sight.
async fn resolve_model(
    conn: &mut Connection,
    context: &SlaveContext,
    task: &NetworkTask,
) -> Result<Arc<cascade_core::ModelSpec>, NetworkError> {
    if let Ok(spec) = context.registry.resolve(task.model) {
        return Ok(spec);
    }
    debug!(model = %task.model, "requesting model from master");
    conn.send(&Message::ModelRequest(task.model)).await?;
    match conn.receive().await? {
        Some(Message::ModelResponse(spec)) => {
            if spec.id() != task.model {
                return Err(NetworkError::protocol(format!(
                    "model response {} does not match requested {}",
                    spec.id(),
                    task.model
                )));
            }
            context.registry.load(spec)?;
            context.registry.resolve(task.model)
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

/// Runs one submitted batch. Returns whether the connection is still
/// usable for further messages.
async fn execute_task(
    conn: &mut Connection,
    task: NetworkTask,
    context: &SlaveContext,
) -> Result<bool, NetworkError> {
    // A model that cannot be resolved fails this task only: the error
    // travels in the result envelope and the connection keeps serving.
    let spec = match resolve_model(conn, context, &task).await {
        Ok(spec) => spec,
        Err(err @ NetworkError::Transport(_)) => return Err(err),
        Err(err) => {
            warn!(model = %task.model, error = %err, "task failed before execution");
            conn.send(&Message::Result(ComputationResult {
                samples: task.sampling,
                completed: 0,
                failed: task.replications,
                origin: Some(context.endpoint.to_string()),
                elapsed_ms: 0,
                error: Some(err.to_string()),
            }))
            .await?;
            return Ok(true);
        }
    };

    // Hold the submission until a worker slot frees up; the announced
    // free capacity is never overcommitted.
    while !try_acquire(context) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(25)) => {}
            received = conn.receive() => match received {
                Ok(Some(Message::Cancel)) => {
                    // Cancelled before a slot opened; nothing ran.
                    conn.send(&Message::Result(ComputationResult {
                        samples: task.sampling,
                        completed: 0,
                        failed: 0,
                        origin: Some(context.endpoint.to_string()),
                        elapsed_ms: 0,
                        error: None,
                    }))
                    .await?;
                    return Ok(true);
                }
                Ok(Some(other)) => {
                    return Err(NetworkError::protocol(format!(
                        "unexpected message while waiting for a slot: tag {:#04x}",
                        other.tag()
                    )));
                }
                Ok(None) | Err(_) => return Ok(false),
            },
        }
    }

    let unit = Arc::new(SimulationUnit::new(
        (*spec).clone(),
        task.initial,
        task.sampling,
        task.deadline,
    ));
    let cancel = CancelToken::new();

    let run_cancel = cancel.clone();
    let run_unit = unit.clone();
    let mut run = tokio::task::spawn_blocking(move || {
        run_batch(
            &run_unit,
            task.seed,
            task.first_replication,
            task.replications,
            &run_cancel,
        )
    });

    let outcome = loop {
        tokio::select! {
            joined = &mut run => break Some(joined),
            received = conn.receive() => match received {
                Ok(Some(Message::Cancel)) => {
                    debug!(model = %task.model, "cancelling running batch");
                    cancel.cancel();
                }
                Ok(Some(other)) => {
                    cancel.cancel();
                    let _ = run.await;
                    release(context);
                    return Err(NetworkError::protocol(format!(
                        "unexpected message while batch runs: tag {:#04x}",
                        other.tag()
                    )));
                }
                // Connection lost mid-batch; the work is abandoned and
                // the master re-dispatches the slice.
                Ok(None) | Err(_) => {
                    cancel.cancel();
                    let _ = run.await;
                    break None;
                }
            },
        }
    };
    release(context);

    match outcome {
        Some(Ok(mut result)) => {
            result.origin = Some(context.endpoint.to_string());
            conn.send(&Message::Result(result)).await?;
            Ok(true)
        }
        Some(Err(join_err)) => {
            warn!(model = %task.model, error = %join_err, "batch worker failed");
            Err(NetworkError::protocol(format!(
                "batch worker failed: {join_err}"
            )))
        }
        None => Ok(false),
    }
}

fn try_acquire(context: &SlaveContext) -> bool {
    context
        .free_capacity
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

fn release(context: &SlaveContext) {
    context.free_capacity.fetch_add(1, Ordering::SeqCst);
}
