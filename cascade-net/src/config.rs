//! Network layer configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_COMPRESSION_THRESHOLD;

/// TLS material locations. Both sides need the CA; servers also need a
/// certificate chain and key.
#[derive(Debug, Clone, Default)]
pub struct TlsPaths {
    pub ca_certificate: PathBuf,
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
}

/// Tunables for discovery, dispatch and the wire codec.
///
/// Defaults match the standard deployment: slaves announce on a UDP
/// broadcast port every few seconds, the master drops a slave after
/// missing a handful of announcements, and payloads past 1 KiB travel
/// compressed.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port slaves accept task connections on.
    pub slave_port: u16,
    /// UDP port discovery announcements are sent to.
    pub discovery_port: u16,
    /// How often a slave announces itself.
    pub announce_interval: Duration,
    /// A slave silent for longer than this is considered gone.
    pub liveness_timeout: Duration,
    /// Consecutive dispatch failures before a slave is dropped.
    pub strike_limit: u32,
    /// Concurrently running campaigns a coordinator accepts.
    pub max_campaigns: usize,
    /// Payload size at which frames switch to compressed encoding.
    pub compression_threshold: usize,
    /// Times a lost batch is re-dispatched before its count is failed.
    pub max_retries: u32,
    /// Replications handed to one slave per dispatch.
    pub max_batch: u32,
    /// TLS material; plain TCP when absent.
    pub tls: Option<TlsPaths>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            slave_port: 9850,
            discovery_port: 9851,
            announce_interval: Duration::from_secs(3),
            liveness_timeout: Duration::from_secs(10),
            strike_limit: 3,
            max_campaigns: 8,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_retries: 3,
            max_batch: 16,
            tls: None,
        }
    }
}
