//! Per-connection driver shared by client and server.
//!
//! After the handshake a connection runs a reader task and, unless that side
//! is passive, a writer task. The controller waits for the negotiated total
//! duration, cancels the connection token (the forced close) and joins both
//! tasks.

use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proto::Options;
use crate::throughput::account::{Aggregates, Role};
use crate::throughput::engine::{run_loop, Cancellable, LoopReport, LoopSpec, Transfer};
use crate::transport::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// State of one established transport endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub side: Side,
    pub transport: TransportKind,
    /// Ordinal of the connection: dial index on the client, accept or
    /// session sequence number on the server.
    pub id: usize,
    /// Connections per host on the client. Unknown on the server.
    pub total: Option<usize>,
    pub remote: String,
    pub options: Options,
}

impl ConnectionContext {
    /// Label used in every log line of the connection, e.g. `2/4`.
    pub fn label(&self) -> String {
        match self.total {
            Some(total) => format!("{}/{}", self.id, total),
            None => format!("#{}", self.id),
        }
    }

    /// Transfer loop parameters for one direction.
    ///
    /// Readers are never throttled; writers honour the negotiated cap.
    pub fn loop_spec(&self, role: Role) -> LoopSpec {
        let (buf_size, max_speed) = match role {
            Role::Reader => (self.options.read_size, 0.0),
            Role::Writer => (self.options.write_size, self.options.max_speed),
        };
        LoopSpec {
            label: self.label(),
            role,
            buf_size,
            report_interval: self.options.report_interval,
            max_speed,
        }
    }
}

/// What one connection measured.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub label: String,
    pub remote: String,
    pub transport: TransportKind,
    pub reader: LoopReport,
    pub writer: Option<LoopReport>,
}

/// Run the reader and optional writer of a connection for its total duration.
pub async fn drive<R, W>(
    ctx: &ConnectionContext,
    reader: R,
    writer: Option<W>,
    aggregates: &Aggregates,
) -> Result<ConnectionReport>
where
    R: Transfer + 'static,
    W: Transfer + 'static,
{
    let label = ctx.label();
    let token = CancellationToken::new();

    info!(
        side = %ctx.side,
        conn = %label,
        transport = %ctx.transport,
        remote = %ctx.remote,
        writer = writer.is_some(),
        "connection starting"
    );

    let reader_task = tokio::spawn(run_loop(
        ctx.loop_spec(Role::Reader),
        Cancellable::new(reader, token.clone()),
        aggregates.reader.clone(),
    ));
    let writer_task = writer.map(|writer| {
        tokio::spawn(run_loop(
            ctx.loop_spec(Role::Writer),
            Cancellable::new(writer, token.clone()),
            aggregates.writer.clone(),
        ))
    });

    tokio::time::sleep(ctx.options.total_duration).await;
    debug!(conn = %label, duration = ?ctx.options.total_duration, "timer fired, closing");
    token.cancel();

    let reader = reader_task
        .await
        .with_context(|| format!("reader task of {} failed", label))?;
    let writer = match writer_task {
        Some(task) => Some(
            task.await
                .with_context(|| format!("writer task of {} failed", label))?,
        ),
        None => None,
    };

    info!(side = %ctx.side, conn = %label, remote = %ctx.remote, "connection closed");

    Ok(ConnectionReport {
        label,
        remote: ctx.remote.clone(),
        transport: ctx.transport,
        reader,
        writer,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::throughput::engine::{StreamReader, StreamWriter};

    fn options(total_ms: u64) -> Options {
        Options {
            read_size: 1_000,
            write_size: 1_000,
            report_interval: Duration::from_millis(100),
            total_duration: Duration::from_millis(total_ms),
            passive_server: false,
            max_speed: 8.0,
            table: BTreeMap::new(),
        }
    }

    fn ctx(total: Option<usize>) -> ConnectionContext {
        ConnectionContext {
            side: Side::Client,
            transport: TransportKind::Tcp,
            id: 2,
            total,
            remote: "127.0.0.1:8080".to_string(),
            options: options(500),
        }
    }

    #[test]
    fn test_label() {
        assert_eq!(ctx(Some(4)).label(), "2/4");
        assert_eq!(ctx(None).label(), "#2");
    }

    #[test]
    fn test_loop_spec_throttles_writer_only() {
        let c = ctx(Some(1));
        let reader = c.loop_spec(Role::Reader);
        assert_eq!(reader.max_speed, 0.0);
        assert_eq!(reader.buf_size, 1_000);

        let writer = c.loop_spec(Role::Writer);
        assert_eq!(writer.max_speed, 8.0);
        assert_eq!(writer.report_interval, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_closes_both_directions() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_rd, local_wr) = tokio::io::split(local);
        // Keep the far end open and draining so only the timer ends the test.
        let (mut remote_rd, _remote_wr) = tokio::io::split(remote);
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut remote_rd, &mut tokio::io::sink()).await;
        });

        let aggregates = Aggregates::new();
        let report = drive(
            &ctx(Some(1)),
            StreamReader::new(local_rd),
            Some(StreamWriter::new(local_wr)),
            &aggregates,
        )
        .await
        .unwrap();

        assert_eq!(report.reader.summary.bytes, 0);
        let writer = report.writer.expect("writer report");
        assert!(writer.summary.bytes > 0);
        assert_eq!(aggregates.reader.snapshot().await.contributions, 1);
        assert_eq!(aggregates.writer.snapshot().await.contributions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_passive_side() {
        let (local, _remote) = tokio::io::duplex(1024);
        let aggregates = Aggregates::new();
        let report = drive(
            &ctx(Some(1)),
            StreamReader::new(local),
            None::<StreamWriter<tokio::io::Sink>>,
            &aggregates,
        )
        .await
        .unwrap();

        assert!(report.writer.is_none());
        assert_eq!(aggregates.writer.snapshot().await.contributions, 0);
    }
}
