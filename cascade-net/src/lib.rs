//! Master/slave network layer for Cascade.
//!
//! Extends the local replication scheduler across machines: a framed,
//! optionally compressed wire protocol over TCP (plain or TLS), UDP
//! broadcast discovery, content-addressed model distribution, slave
//! servers executing batches, and the master coordinator that dispatches
//! campaigns and recovers from partial failure.

pub mod client;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod master;
pub mod registry;
pub mod slave;
pub mod transport;
pub mod wire;

use thiserror::Error;

use cascade_core::{ModelId, SimulationError};

pub use client::Client;
pub use config::{NetworkConfig, TlsPaths};
pub use discovery::{
    Announcement, DiscoveryAnnouncer, DiscoveryListener, SlaveEntry, SlaveRegistry, SlaveStatus,
};
pub use endpoint::{Endpoint, TransportKind};
pub use master::{CampaignId, CampaignStatus, MasterCoordinator, MasterServer, RemoteExecutor};
pub use registry::ModelRegistry;
pub use slave::{SlaveHandle, SlavePhase, SlaveServer};
pub use transport::{Connection, Listener, TlsConfig};
pub use wire::{Message, MessageCodec, NetworkTask};

/// Errors produced by the network layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unknown model {id}")]
    UnknownModel { id: ModelId },

    #[error("Model failed to load: {reason}")]
    Load { reason: String },

    #[error("No live slave available")]
    NoSlaveAvailable,

    #[error("Coordinator is at campaign capacity")]
    Busy,

    #[error("Campaign {id} not found")]
    UnknownCampaign { id: uuid::Uuid },

    #[error("TLS configuration error: {reason}")]
    Tls { reason: String },

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

impl NetworkError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}
