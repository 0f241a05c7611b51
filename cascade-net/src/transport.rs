//! Byte transport beneath the wire protocol: plain TCP or TLS.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::NetworkError;
use crate::config::TlsPaths;
use crate::endpoint::{Endpoint, TransportKind};
use crate::wire::{Message, MessageCodec, write_message};

/// Loaded TLS material for both connection directions.
#[derive(Clone)]
pub struct TlsConfig {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Loads PEM material from disk and builds both sides.
    ///
    /// # Errors
    /// - `NetworkError::Tls` - unreadable or malformed PEM files
    pub fn from_paths(paths: &TlsPaths) -> Result<Self, NetworkError> {
        let ca_certs = load_certs(&paths.ca_certificate)?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(|err| NetworkError::Tls {
                reason: format!("rejected CA certificate: {err}"),
            })?;
        }

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let chain = load_certs(&paths.certificate_chain)?;
        let key = {
            let mut reader = open_pem(&paths.private_key)?;
            rustls_pemfile::private_key(&mut reader)
                .map_err(|err| NetworkError::Tls {
                    reason: format!("failed to read private key: {err}"),
                })?
                .ok_or_else(|| NetworkError::Tls {
                    reason: format!("no private key in {}", paths.private_key.display()),
                })?
        };
        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|err| NetworkError::Tls {
                reason: format!("invalid server certificate: {err}"),
            })?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }

    fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

fn open_pem(path: &std::path::Path) -> Result<BufReader<File>, NetworkError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| NetworkError::Tls {
            reason: format!("cannot open {}: {err}", path.display()),
        })
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| NetworkError::Tls {
            reason: format!("malformed certificate in {}: {err}", path.display()),
        })
}

enum NetStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One framed protocol connection to a peer.
pub struct Connection {
    stream: NetStream,
    codec: MessageCodec,
    peer: SocketAddr,
    buf: BytesMut,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl Connection {
    /// Opens a connection to `endpoint`, performing the TLS handshake
    /// when its transport demands one.
    ///
    /// # Errors
    /// - `NetworkError::Transport` - connect or handshake failure
    /// - `NetworkError::Tls` - a TLS endpoint without TLS material
    pub async fn connect(
        endpoint: Endpoint,
        tls: Option<&TlsConfig>,
        codec: MessageCodec,
    ) -> Result<Self, NetworkError> {
        if endpoint.kind == TransportKind::Tls && tls.is_none() {
            return Err(NetworkError::Tls {
                reason: format!("endpoint {endpoint} requires TLS material"),
            });
        }
        let tcp = TcpStream::connect(endpoint.socket_addr()).await?;
        let peer = tcp.peer_addr()?;
        let stream = match (endpoint.kind, tls) {
            (TransportKind::Tcp, _) | (TransportKind::Tls, None) => NetStream::Tcp(tcp),
            (TransportKind::Tls, Some(tls)) => {
                let name = ServerName::try_from(endpoint.addr.to_string()).map_err(|err| {
                    NetworkError::Tls {
                        reason: format!("invalid server name for {endpoint}: {err}"),
                    }
                })?;
                let stream = tls.connector.connect(name, tcp).await?;
                NetStream::Tls(Box::new(TlsStream::Client(stream)))
            }
        };
        Ok(Self {
            stream,
            codec,
            peer,
            buf: BytesMut::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        match &mut self.stream {
            NetStream::Tcp(stream) => write_message(stream, &self.codec, message).await,
            NetStream::Tls(stream) => write_message(stream.as_mut(), &self.codec, message).await,
        }
    }

    /// Receives the next message; `None` when the peer closed cleanly at
    /// a frame boundary.
    ///
    /// Cancellation-safe: a dropped receive never loses bytes, so the
    /// caller may race it against timers or control futures in `select!`.
    pub async fn receive(&mut self) -> Result<Option<Message>, NetworkError> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(message));
            }
            let read = match &mut self.stream {
                NetStream::Tcp(stream) => stream.read_buf(&mut self.buf).await?,
                NetStream::Tls(stream) => stream.read_buf(&mut self.buf).await?,
            };
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(NetworkError::protocol("peer closed mid-frame"));
            }
        }
    }
}

/// Accepts framed protocol connections, with or without TLS.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsConfig>,
    codec: MessageCodec,
}

impl Listener {
    /// Binds to `addr`. With TLS material present every accepted
    /// connection must complete a handshake.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsConfig>,
        codec: MessageCodec,
    ) -> Result<Self, NetworkError> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner, tls, codec })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.inner.local_addr()?)
    }

    /// Accepts the next connection.
    pub async fn accept(&self) -> Result<Connection, NetworkError> {
        let (tcp, peer) = self.inner.accept().await?;
        let stream = match &self.tls {
            None => NetStream::Tcp(tcp),
            Some(tls) => {
                let stream = tls.acceptor().accept(tcp).await?;
                NetStream::Tls(Box::new(TlsStream::Server(stream)))
            }
        };
        Ok(Connection {
            stream,
            codec: self.codec.clone(),
            peer,
            buf: BytesMut::new(),
        })
    }
}
