//! UDP slave discovery and the registry of known slaves.
//!
//! Slaves announce themselves periodically and answer queries; the
//! master's listener folds every sighting into a [`SlaveRegistry`],
//! which tracks liveness and dispatch failures per slave.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::NetworkError;
use crate::endpoint::Endpoint;
use crate::wire::{Message, MessageCodec};

/// What a slave says about itself: where to reach it and how many
/// batches it can take right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub endpoint: Endpoint,
    pub free_capacity: usize,
}

/// Dispatch availability of a known slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveStatus {
    Idle,
    Busy,
    Disconnected,
}

/// Registry record for one slave.
#[derive(Debug, Clone)]
pub struct SlaveEntry {
    pub announcement: Announcement,
    pub last_seen: Instant,
    pub strikes: u32,
    pub status: SlaveStatus,
}

/// Live view of the slave pool, shared between the discovery listener
/// and the dispatcher.
#[derive(Debug, Clone)]
pub struct SlaveRegistry {
    entries: Arc<RwLock<HashMap<Endpoint, SlaveEntry>>>,
    liveness_timeout: Duration,
    strike_limit: u32,
}

impl SlaveRegistry {
    pub fn new(liveness_timeout: Duration, strike_limit: u32) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            liveness_timeout,
            strike_limit: strike_limit.max(1),
        }
    }

    /// Records a sighting. A fresh announcement clears accumulated
    /// strikes and revives a disconnected slave.
    pub fn observe(&self, announcement: Announcement) {
        let mut entries = self.entries.write();
        let endpoint = announcement.endpoint;
        match entries.get_mut(&endpoint) {
            Some(entry) => {
                entry.announcement = announcement;
                entry.last_seen = Instant::now();
                entry.strikes = 0;
                if entry.status == SlaveStatus::Disconnected {
                    entry.status = SlaveStatus::Idle;
                }
            }
            None => {
                debug!(slave = %endpoint, "discovered slave");
                entries.insert(
                    endpoint,
                    SlaveEntry {
                        announcement,
                        last_seen: Instant::now(),
                        strikes: 0,
                        status: SlaveStatus::Idle,
                    },
                );
            }
        }
    }

    /// Marks slaves silent past the liveness timeout as disconnected and
    /// returns how many are still live.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let now = Instant::now();
        let mut live = 0;
        for entry in entries.values_mut() {
            if now.duration_since(entry.last_seen) > self.liveness_timeout {
                if entry.status != SlaveStatus::Disconnected {
                    debug!(slave = %entry.announcement.endpoint, "slave went silent");
                    entry.status = SlaveStatus::Disconnected;
                }
            } else if entry.status != SlaveStatus::Disconnected {
                live += 1;
            }
        }
        live
    }

    /// Number of slaves currently considered live.
    pub fn live_count(&self) -> usize {
        self.sweep()
    }

    /// Picks the idle live slave with the most free capacity, breaking
    /// ties by endpoint order so repeated selection is deterministic.
    pub fn select_idle(&self) -> Option<Endpoint> {
        self.sweep();
        let entries = self.entries.read();
        entries
            .values()
            .filter(|e| e.status == SlaveStatus::Idle && e.announcement.free_capacity > 0)
            .map(|e| (e.announcement.free_capacity, e.announcement.endpoint))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
            .map(|(_, endpoint)| endpoint)
    }

    pub fn mark_busy(&self, endpoint: Endpoint) {
        if let Some(entry) = self.entries.write().get_mut(&endpoint) {
            entry.status = SlaveStatus::Busy;
        }
    }

    pub fn mark_idle(&self, endpoint: Endpoint) {
        if let Some(entry) = self.entries.write().get_mut(&endpoint)
            && entry.status != SlaveStatus::Disconnected
        {
            entry.status = SlaveStatus::Idle;
        }
    }

    /// Records a dispatch failure. The slave is dropped from the pool
    /// once its strikes reach the limit; returns whether it was dropped.
    pub fn strike(&self, endpoint: Endpoint) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&endpoint) else {
            return false;
        };
        entry.strikes += 1;
        if entry.strikes >= self.strike_limit {
            warn!(slave = %endpoint, strikes = entry.strikes, "dropping slave");
            entries.remove(&endpoint);
            true
        } else {
            entry.status = SlaveStatus::Idle;
            false
        }
    }

    pub fn entry(&self, endpoint: Endpoint) -> Option<SlaveEntry> {
        self.entries.read().get(&endpoint).cloned()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.entries.read().keys().copied().collect();
        endpoints.sort();
        endpoints
    }
}

/// Master-side discovery: receives announcements and replies, can probe
/// with a query.
pub struct DiscoveryListener {
    socket: Arc<UdpSocket>,
    registry: SlaveRegistry,
    codec: MessageCodec,
}

impl DiscoveryListener {
    /// Binds the discovery socket at `addr`.
    pub async fn bind(
        addr: SocketAddr,
        registry: SlaveRegistry,
        codec: MessageCodec,
    ) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            registry,
            codec,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends a discovery query to `target`, typically a broadcast address.
    pub async fn query(&self, target: SocketAddr) -> Result<(), NetworkError> {
        let frame = self.codec.encode_frame(&Message::DiscoveryQuery)?;
        self.socket.send_to(&frame, target).await?;
        Ok(())
    }

    /// Receives datagrams forever, folding sightings into the registry.
    /// Malformed datagrams are logged and skipped.
    pub async fn run(self) -> Result<(), NetworkError> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match self.codec.decode_frame(&buf[..len]) {
                Ok(Message::DiscoveryAnnounce(ann)) | Ok(Message::DiscoveryReply(ann)) => {
                    trace!(slave = %ann.endpoint, free = ann.free_capacity, "sighting");
                    self.registry.observe(ann);
                }
                Ok(other) => {
                    trace!(from = %from, message = ?other.tag(), "ignoring datagram");
                }
                Err(err) => {
                    warn!(from = %from, error = %err, "malformed discovery datagram");
                }
            }
        }
    }
}

/// Slave-side discovery: announces periodically and answers queries.
pub struct DiscoveryAnnouncer {
    socket: UdpSocket,
    target: SocketAddr,
    endpoint: Endpoint,
    free_capacity: Arc<AtomicUsize>,
    interval: Duration,
    codec: MessageCodec,
}

impl DiscoveryAnnouncer {
    /// Binds an ephemeral socket that will announce to `target`.
    ///
    /// `free_capacity` is shared with the slave server, which keeps it
    /// current as batches start and finish.
    pub async fn bind(
        target: SocketAddr,
        endpoint: Endpoint,
        free_capacity: Arc<AtomicUsize>,
        interval: Duration,
        codec: MessageCodec,
    ) -> Result<Self, NetworkError> {
        let bind_addr = if target.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            target,
            endpoint,
            free_capacity,
            interval,
            codec,
        })
    }

    fn announcement(&self) -> Announcement {
        Announcement {
            endpoint: self.endpoint,
            free_capacity: self.free_capacity.load(Ordering::SeqCst),
        }
    }

    /// Announces on every interval tick and replies to queries, forever.
    pub async fn run(self) -> Result<(), NetworkError> {
        let mut ticker = tokio::time::interval(self.interval);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = self
                        .codec
                        .encode_frame(&Message::DiscoveryAnnounce(self.announcement()))?;
                    if let Err(err) = self.socket.send_to(&frame, self.target).await {
                        warn!(target = %self.target, error = %err, "announce failed");
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    if let Ok(Message::DiscoveryQuery) = self.codec.decode_frame(&buf[..len]) {
                        let frame = self
                            .codec
                            .encode_frame(&Message::DiscoveryReply(self.announcement()))?;
                        if let Err(err) = self.socket.send_to(&frame, from).await {
                            warn!(to = %from, error = %err, "query reply failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn announcement(port: u16, free: usize) -> Announcement {
        Announcement {
            endpoint: endpoint(port),
            free_capacity: free,
        }
    }

    #[test]
    fn selection_prefers_most_free_capacity() {
        let registry = SlaveRegistry::new(Duration::from_secs(10), 3);
        registry.observe(announcement(9001, 2));
        registry.observe(announcement(9002, 8));
        registry.observe(announcement(9003, 8));

        // Equal capacity falls back to endpoint order.
        assert_eq!(registry.select_idle(), Some(endpoint(9002)));

        registry.mark_busy(endpoint(9002));
        assert_eq!(registry.select_idle(), Some(endpoint(9003)));
        registry.mark_busy(endpoint(9003));
        assert_eq!(registry.select_idle(), Some(endpoint(9001)));
        registry.mark_busy(endpoint(9001));
        assert_eq!(registry.select_idle(), None);
    }

    #[test]
    fn slaves_with_no_capacity_are_skipped() {
        let registry = SlaveRegistry::new(Duration::from_secs(10), 3);
        registry.observe(announcement(9001, 0));
        assert_eq!(registry.select_idle(), None);
    }

    #[test]
    fn strikes_drop_a_slave_at_the_limit() {
        let registry = SlaveRegistry::new(Duration::from_secs(10), 2);
        registry.observe(announcement(9001, 4));

        assert!(!registry.strike(endpoint(9001)));
        assert_eq!(registry.entry(endpoint(9001)).unwrap().strikes, 1);

        assert!(registry.strike(endpoint(9001)));
        assert!(registry.entry(endpoint(9001)).is_none());
    }

    #[test]
    fn fresh_announcement_clears_strikes() {
        let registry = SlaveRegistry::new(Duration::from_secs(10), 3);
        registry.observe(announcement(9001, 4));
        registry.strike(endpoint(9001));
        registry.observe(announcement(9001, 4));
        assert_eq!(registry.entry(endpoint(9001)).unwrap().strikes, 0);
    }

    #[test]
    fn silent_slaves_expire() {
        let registry = SlaveRegistry::new(Duration::from_millis(0), 3);
        registry.observe(announcement(9001, 4));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.select_idle(), None);
        assert_eq!(
            registry.entry(endpoint(9001)).unwrap().status,
            SlaveStatus::Disconnected
        );

        // A new sighting revives it.
        registry.observe(announcement(9001, 4));
        assert_eq!(registry.select_idle(), Some(endpoint(9001)));
    }

    #[tokio::test]
    async fn announcer_reaches_listener() {
        let codec = MessageCodec::default();
        let registry = SlaveRegistry::new(Duration::from_secs(10), 3);
        let listener = DiscoveryListener::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            registry.clone(),
            codec.clone(),
        )
        .await
        .unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(listener.run());

        let free = Arc::new(AtomicUsize::new(4));
        let announcer = DiscoveryAnnouncer::bind(
            target,
            endpoint(9850),
            free,
            Duration::from_millis(20),
            codec,
        )
        .await
        .unwrap();
        tokio::spawn(announcer.run());

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if registry.select_idle() == Some(endpoint(9850)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("announcement never arrived");
    }

    #[tokio::test]
    async fn query_is_answered_with_a_reply() {
        let codec = MessageCodec::default();
        // Sink for the announcer's periodic announcements; the query is
        // sent from a separate probe socket so the reply proves the
        // query path rather than the announce path.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let announcer = DiscoveryAnnouncer::bind(
            sink.local_addr().unwrap(),
            endpoint(9860),
            Arc::new(AtomicUsize::new(2)),
            Duration::from_secs(3600),
            codec.clone(),
        )
        .await
        .unwrap();
        let announcer_addr = announcer.socket.local_addr().unwrap();
        tokio::spawn(announcer.run());

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = codec.encode_frame(&Message::DiscoveryQuery).unwrap();
        probe.send_to(&query, announcer_addr).await.unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
            .await
            .expect("query reply never arrived")
            .unwrap();
        match codec.decode_frame(&buf[..len]).unwrap() {
            Message::DiscoveryReply(ann) => {
                assert_eq!(ann.endpoint, endpoint(9860));
                assert_eq!(ann.free_capacity, 2);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
