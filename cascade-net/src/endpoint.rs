//! Network endpoint identities.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::NetworkError;

/// Transport used to reach an endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
}

/// One reachable process: address, port and transport.
///
/// Ordered so slave selection can break ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
    pub kind: TransportKind,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16, kind: TransportKind) -> Self {
        Self { addr, port, kind }
    }

    pub fn tcp(addr: IpAddr, port: u16) -> Self {
        Self::new(addr, port, TransportKind::Tcp)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::tcp(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        };
        write!(f, "{scheme}://{}:{}", self.addr, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    /// Parses `host:port` or `tcp://host:port` / `tls://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.split_once("://") {
            Some(("tcp", rest)) => (TransportKind::Tcp, rest),
            Some(("tls", rest)) => (TransportKind::Tls, rest),
            Some((scheme, _)) => {
                return Err(NetworkError::protocol(format!(
                    "unknown endpoint scheme: {scheme}"
                )));
            }
            None => (TransportKind::Tcp, s),
        };
        let addr: SocketAddr = rest
            .parse()
            .map_err(|_| NetworkError::protocol(format!("malformed endpoint: {s}")))?;
        Ok(Self::new(addr.ip(), addr.port(), kind))
    }
}
