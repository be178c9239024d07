//! Client mode.
//!
//! Dials every configured host `connections` times, runs the handshake on
//! each connection and drives it for the configured duration. A failed dial
//! or handshake only costs that one connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::BenchConfig;
use crate::connection::{drive, ConnectionContext, ConnectionReport, Side};
use crate::proto::{wire, HandshakeError};
use crate::throughput::account::{Aggregates, Role};
use crate::throughput::engine::{StreamReader, StreamWriter, UdpReceiver, UdpSender};
use crate::throughput::report::{format_totals, RunSummary};
use crate::transport::{append_port_if_missing, BoxStream, Dialer, TransportKind};

/// Upper bound for the server's ack on a stream connection.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    config: BenchConfig,
    aggregates: Aggregates,
}

impl Client {
    pub fn new(config: BenchConfig) -> Self {
        Self {
            config,
            aggregates: Aggregates::new(),
        }
    }

    /// Run every connection to completion and collect their reports.
    pub async fn run(&self) -> Result<RunSummary> {
        let config = &self.config;
        let use_tls = config.tls.enabled && !config.udp;
        let dialer = Dialer::new(config.local_addr.as_deref(), use_tls).await?;
        let port = config.port_suffix();
        let options = config.options();

        let mut tasks = JoinSet::new();
        let mut seq = 0usize;

        for host in &config.hosts {
            let target = append_port_if_missing(host, &port);

            for i in 0..config.connections {
                info!(
                    conn = %format!("{}/{}", i, config.connections),
                    addr = %target,
                    udp = config.udp,
                    tls = use_tls,
                    "opening connection"
                );

                let mut ctx = ConnectionContext {
                    side: Side::Client,
                    transport: TransportKind::Udp,
                    id: i,
                    total: Some(config.connections),
                    remote: target.clone(),
                    options: options.clone(),
                };
                let aggregates = self.aggregates.clone();
                let passive = config.passive_client;

                if config.udp {
                    match dialer.dial_udp(&target).await {
                        Ok(socket) => {
                            tasks.spawn(tagged(seq, run_udp(ctx, socket, passive, aggregates)));
                        }
                        Err(e) => {
                            warn!(addr = %target, error = %e, "dial failed, skipping connection");
                            continue;
                        }
                    }
                } else {
                    match dialer.dial_stream(&target).await {
                        Ok((stream, kind)) => {
                            ctx.transport = kind;
                            tasks.spawn(tagged(seq, run_stream(ctx, stream, passive, aggregates)));
                        }
                        Err(e) => {
                            warn!(addr = %target, error = %e, "dial failed, skipping connection");
                            continue;
                        }
                    }
                }
                seq += 1;
            }
        }

        let mut reports = Vec::new();
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok((seq, Ok(report))) => reports.push((seq, report)),
                Ok((_, Err(e))) => warn!(error = %format!("{:#}", e), "connection aborted"),
                Err(e) => error!(error = %e, "connection task failed"),
            }
        }
        reports.sort_by_key(|(seq, _)| *seq);

        let reader = self.aggregates.reader.snapshot().await;
        let writer = self.aggregates.writer.snapshot().await;
        info!("{}", format_totals(Role::Reader, &reader));
        info!("{}", format_totals(Role::Writer, &writer));

        Ok(RunSummary {
            connections: reports.into_iter().map(|(_, report)| report).collect(),
            reader,
            writer,
        })
    }
}

async fn tagged<F, T>(seq: usize, fut: F) -> (usize, T)
where
    F: std::future::Future<Output = T>,
{
    (seq, fut.await)
}

async fn run_stream(
    ctx: ConnectionContext,
    mut stream: BoxStream,
    passive: bool,
    aggregates: Aggregates,
) -> Result<ConnectionReport> {
    let label = ctx.label();

    wire::send_options(&mut stream, &ctx.options)
        .await
        .with_context(|| format!("{} sending options", label))?;
    debug!(conn = %label, "options sent");

    tokio::time::timeout(ACK_TIMEOUT, wire::recv_ack(&mut stream))
        .await
        .map_err(|_| HandshakeError::Timeout(ACK_TIMEOUT))
        .and_then(|res| res)
        .with_context(|| format!("{} receiving ack", label))?;
    debug!(conn = %label, transport = %ctx.transport, "ack received");

    let (rd, wr) = tokio::io::split(stream);
    let writer = (!passive).then(|| StreamWriter::new(wr));
    drive(&ctx, StreamReader::new(rd), writer, &aggregates).await
}

async fn run_udp(
    ctx: ConnectionContext,
    socket: UdpSocket,
    passive: bool,
    aggregates: Aggregates,
) -> Result<ConnectionReport> {
    let label = ctx.label();
    let socket = Arc::new(socket);

    let datagram = wire::options_datagram(&ctx.options)
        .with_context(|| format!("{} encoding options", label))?;
    socket
        .send(&datagram)
        .await
        .with_context(|| format!("{} sending options", label))?;
    debug!(conn = %label, "options sent");

    let writer = (!passive).then(|| UdpSender::new(socket.clone()));
    drive(&ctx, UdpReceiver::new(socket), writer, &aggregates).await
}
