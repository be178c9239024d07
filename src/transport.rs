//! Dialing and listening.
//!
//! Stream dials try TLS first and fall back to plain TCP on any TLS failure.
//! Listeners accept plain TCP and, when a TLS acceptor is configured, run the
//! server side of the TLS handshake inside the connection task so a slow peer
//! never stalls the accept loop.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::proto::tls;

/// Upper bound for either side of a TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Tls,
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Tls => write!(f, "TLS"),
            TransportKind::Udp => write!(f, "UDP"),
        }
    }
}

/// A byte stream usable by the handshake and the transfer loop.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxStream = Box<dyn ByteStream>;

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Append `port` (e.g. `":8080"`) unless `host` already carries one.
///
/// The host is scanned from the end: a `:` before any `]` means a port is
/// present; reaching `]` first means a bracketed IPv6 literal without port.
pub fn append_port_if_missing(host: &str, port: &str) -> String {
    for c in host.chars().rev() {
        match c {
            ']' => break,
            ':' => return host.to_string(),
            _ => {}
        }
    }
    format!("{}{}", host, port)
}

/// Bind candidates for a listen address, in order of preference.
///
/// A bare `:port` listens on every interface: the IPv6 wildcard first, which
/// also accepts IPv4 on dual-stack hosts, then the IPv4 wildcard for hosts
/// without IPv6.
pub fn listen_addrs(addr: &str) -> Vec<String> {
    if addr.starts_with(':') {
        vec![format!("[::]{}", addr), format!("0.0.0.0{}", addr)]
    } else {
        vec![addr.to_string()]
    }
}

/// Bind the first candidate of `addr` that succeeds.
async fn bind_first<T, F, Fut>(addr: &str, proto: &str, bind: F) -> Result<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut last_err = None;
    for candidate in listen_addrs(addr) {
        match bind(candidate.clone()).await {
            Ok(bound) => return Ok(bound),
            Err(e) => {
                debug!(addr = %candidate, error = %e, "{} bind failed", proto);
                last_err = Some((candidate, e));
            }
        }
    }
    match last_err {
        Some((candidate, e)) => {
            Err(e).with_context(|| format!("failed to bind {} on {}", proto, candidate))
        }
        None => Err(anyhow!("no address to bind for {}", addr)),
    }
}

/// Host part of `host:port` or `[v6]:port`, without brackets.
pub fn host_part(target: &str) -> &str {
    let host = match target.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => host,
        _ => target,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn resolve(target: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host(target)
        .await
        .with_context(|| format!("failed to resolve {}", target))?
        .collect();
    if addrs.is_empty() {
        anyhow::bail!("{} resolved to no address", target);
    }
    Ok(addrs)
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// Client-side connection factory shared by every connection of a run.
#[derive(Clone)]
pub struct Dialer {
    local: Option<SocketAddr>,
    tls: Option<TlsConnector>,
}

impl Dialer {
    /// `local_addr` binds every outbound socket; a missing port means any.
    pub async fn new(local_addr: Option<&str>, use_tls: bool) -> Result<Self> {
        let local = match local_addr {
            Some(addr) => {
                let addr = append_port_if_missing(addr, ":0");
                let resolved = resolve(&addr)
                    .await
                    .with_context(|| format!("invalid local address {}", addr))?;
                Some(resolved[0])
            }
            None => None,
        };

        let tls = if use_tls {
            let config = tls::build_client_config()?;
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        Ok(Self { local, tls })
    }

    /// Dial a stream connection, preferring TLS when enabled.
    pub async fn dial_stream(&self, target: &str) -> Result<(BoxStream, TransportKind)> {
        if let Some(connector) = &self.tls {
            match self.dial_tls(connector, target).await {
                Ok(stream) => return Ok((Box::new(stream) as BoxStream, TransportKind::Tls)),
                Err(e) => {
                    warn!(addr = target, error = %e, "TLS dial failed, falling back to plain TCP");
                }
            }
        }

        let stream = self.dial_tcp(target).await?;
        Ok((Box::new(stream) as BoxStream, TransportKind::Tcp))
    }

    async fn dial_tls(
        &self,
        connector: &TlsConnector,
        target: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = self.dial_tcp(target).await?;
        let name = tls::server_name(host_part(target));
        let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(name, tcp))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out after {:?}", TLS_HANDSHAKE_TIMEOUT))?
            .with_context(|| format!("TLS handshake with {} failed", target))?;
        debug!(addr = target, "TLS established");
        Ok(stream)
    }

    async fn dial_tcp(&self, target: &str) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in resolve(target).await? {
            match self.connect_tcp(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("no address to dial"))
            .context(format!("failed to connect to {}", target)))
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(local) = self.local.filter(|l| l.is_ipv4() == addr.is_ipv4()) {
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
        }
        socket.connect(addr).await
    }

    /// Open a UDP socket connected to `target`.
    pub async fn dial_udp(&self, target: &str) -> Result<UdpSocket> {
        let peer = resolve(target).await?[0];
        let local = self
            .local
            .filter(|l| l.is_ipv4() == peer.is_ipv4())
            .unwrap_or_else(|| unspecified_for(&peer));

        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", local))?;
        socket
            .connect(peer)
            .await
            .with_context(|| format!("failed to connect UDP socket to {}", peer))?;
        Ok(socket)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// TCP listener, optionally terminating TLS.
pub struct StreamListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl StreamListener {
    pub async fn bind(addr: &str, acceptor: Option<TlsAcceptor>) -> Result<Self> {
        let listener = bind_first(addr, "TCP listener", TcpListener::bind).await?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn kind(&self) -> TransportKind {
        if self.acceptor.is_some() {
            TransportKind::Tls
        } else {
            TransportKind::Tcp
        }
    }

    /// Accept one TCP connection. TLS, if any, is left to [`PendingStream::establish`].
    pub async fn accept(&self) -> io::Result<PendingStream> {
        let (tcp, peer) = self.listener.accept().await?;
        tcp.set_nodelay(true).ok();
        Ok(PendingStream {
            tcp,
            peer,
            acceptor: self.acceptor.clone(),
        })
    }
}

/// An accepted connection whose TLS handshake has not run yet.
pub struct PendingStream {
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl PendingStream {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn establish(self) -> Result<(BoxStream, TransportKind)> {
        match self.acceptor {
            Some(acceptor) => {
                let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(self.tcp))
                    .await
                    .map_err(|_| {
                        anyhow!("TLS handshake timed out after {:?}", TLS_HANDSHAKE_TIMEOUT)
                    })?
                    .with_context(|| format!("TLS handshake with {} failed", self.peer))?;
                Ok((Box::new(stream) as BoxStream, TransportKind::Tls))
            }
            None => Ok((Box::new(self.tcp) as BoxStream, TransportKind::Tcp)),
        }
    }
}

/// Bind the shared UDP socket of a listen address.
pub async fn bind_udp(addr: &str) -> Result<UdpSocket> {
    bind_first(addr, "UDP socket", UdpSocket::bind).await
}
