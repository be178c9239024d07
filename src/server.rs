//! Server mode.
//!
//! Every listen address gets a TCP listener (TLS when a key pair loads) and a
//! UDP socket. Stream connections run the server side of the handshake and
//! are then driven like client connections; UDP peers go through the
//! [`crate::session`] table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BenchConfig;
use crate::connection::{drive, ConnectionContext, Side};
use crate::proto::{tls, wire, HandshakeError};
use crate::session::run_udp_listener;
use crate::throughput::account::{Aggregates, Role};
use crate::throughput::engine::{StreamReader, StreamWriter};
use crate::throughput::report::format_totals;
use crate::transport::{append_port_if_missing, bind_udp, PendingStream, StreamListener};

/// Upper bound for receiving the client's options on a stream connection.
pub const OPTIONS_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bound listeners of a server run.
///
/// [`Server::bind`] binds everything up front so callers can query the bound
/// addresses before [`Server::run`] starts serving.
pub struct Server {
    stream_listeners: Vec<StreamListener>,
    udp_sockets: Vec<UdpSocket>,
    read_size: usize,
    aggregates: Aggregates,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind a TCP listener and a UDP socket per configured listen address.
    ///
    /// A TLS key pair that fails to load disables TLS for the whole run. A
    /// listen address that fails to bind is logged and skipped; binding
    /// fails only when nothing could be bound at all.
    pub async fn bind(config: &BenchConfig) -> Result<Self> {
        let acceptor = if config.tls.enabled {
            match tls::load_server_config(&config.tls.cert, &config.tls.key) {
                Ok(server_config) => Some(TlsAcceptor::from(Arc::new(server_config))),
                Err(e) => {
                    warn!(error = %e, "failure loading TLS key pair, disabling TLS");
                    None
                }
            }
        } else {
            None
        };

        let port = config.port_suffix();
        let mut stream_listeners = Vec::new();
        let mut udp_sockets = Vec::new();

        for listener in &config.listeners {
            let addr = append_port_if_missing(listener, &port);

            match StreamListener::bind(&addr, acceptor.clone()).await {
                Ok(l) => {
                    if let Ok(local) = l.local_addr() {
                        info!(addr = %local, transport = %l.kind(), "listening");
                    }
                    stream_listeners.push(l);
                }
                Err(e) => error!(addr = %addr, error = %e, "TCP listen failed"),
            }

            match bind_udp(&addr).await {
                Ok(socket) => udp_sockets.push(socket),
                Err(e) => error!(addr = %addr, error = %e, "UDP listen failed"),
            }
        }

        if stream_listeners.is_empty() && udp_sockets.is_empty() {
            anyhow::bail!("no listen address could be bound");
        }

        Ok(Self {
            stream_listeners,
            udp_sockets,
            read_size: config.read_size,
            aggregates: Aggregates::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bound TCP listener addresses.
    pub fn stream_addrs(&self) -> Vec<SocketAddr> {
        self.stream_listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Bound UDP socket addresses.
    pub fn udp_addrs(&self) -> Vec<SocketAddr> {
        self.udp_sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Shared reader/writer totals of every connection this server runs.
    pub fn aggregates(&self) -> Aggregates {
        self.aggregates.clone()
    }

    /// Token that stops the server. Listeners stop accepting, in-flight
    /// connections run to the end of their duration.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until every listener has ended.
    pub async fn run(self) -> Result<()> {
        let mut listeners = JoinSet::new();

        for listener in self.stream_listeners {
            listeners.spawn(accept_loop(
                listener,
                self.aggregates.clone(),
                self.shutdown.clone(),
            ));
        }
        for socket in self.udp_sockets {
            listeners.spawn(run_udp_listener(
                socket,
                self.read_size,
                self.aggregates.clone(),
                self.shutdown.clone(),
            ));
        }

        while let Some(res) = listeners.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "listener task failed");
            }
        }

        let reader = self.aggregates.reader.snapshot().await;
        let writer = self.aggregates.writer.snapshot().await;
        info!("{}", format_totals(Role::Reader, &reader));
        info!("{}", format_totals(Role::Writer, &writer));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stream connections
// ---------------------------------------------------------------------------

async fn accept_loop(listener: StreamListener, aggregates: Aggregates, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();
    let mut next_id = 0usize;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    error!(error = %e, "connection task failed");
                }
            }

            res = listener.accept() => match res {
                Ok(pending) => {
                    let id = next_id;
                    next_id += 1;
                    connections.spawn(handle_connection(pending, id, aggregates.clone()));
                }
                Err(e) => {
                    error!(error = %e, "accept failed, closing listener");
                    break;
                }
            },
        }
    }

    while let Some(res) = connections.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "connection task failed");
        }
    }
}

async fn handle_connection(pending: PendingStream, id: usize, aggregates: Aggregates) {
    let peer = pending.peer();

    let (mut stream, transport) = match pending.establish().await {
        Ok(established) => established,
        Err(e) => {
            warn!(peer = %peer, error = %e, "incoming connection dropped");
            return;
        }
    };
    info!(peer = %peer, transport = %transport, "incoming connection");

    let options = match tokio::time::timeout(OPTIONS_TIMEOUT, wire::recv_options(&mut stream)).await
    {
        Ok(Ok(options)) => options,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "options failure");
            return;
        }
        Err(_) => {
            let e = HandshakeError::Timeout(OPTIONS_TIMEOUT);
            warn!(peer = %peer, error = %e, "options failure");
            return;
        }
    };
    debug!(peer = %peer, ?options, "options received");

    if let Err(e) = wire::send_ack(&mut stream).await {
        warn!(peer = %peer, error = %e, "sending ack failed");
        return;
    }

    let ctx = ConnectionContext {
        side: Side::Server,
        transport,
        id,
        total: None,
        remote: peer.to_string(),
        options,
    };

    let (rd, wr) = tokio::io::split(stream);
    let writer = (!ctx.options.passive_server).then(|| StreamWriter::new(wr));

    match drive(&ctx, StreamReader::new(rd), writer, &aggregates).await {
        Ok(report) => debug!(
            conn = %report.label,
            bytes_read = report.reader.summary.bytes,
            "connection finished"
        ),
        Err(e) => warn!(peer = %peer, error = %e, "connection failed"),
    }
}
