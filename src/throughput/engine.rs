//! Rate-controlled transfer loop.
//!
//! One loop serves every direction and transport: the transport-specific part
//! is a [`Transfer`] that moves at most one buffer per call. The loop yields,
//! applies the optional rate cap, performs one transfer and feeds the result
//! into an [`Account`]. The first transfer error ends the loop; that is the
//! normal way a test finishes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::account::{Account, Aggregate, Role, Sample, Summary};

/// Pause taken when the current window is above the rate cap.
pub const THROTTLE_PAUSE: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// One bounded transfer against a transport.
///
/// Readers fill `buf` and return the bytes received. Writers send the
/// contents of `buf` and return the bytes accepted.
#[async_trait]
pub trait Transfer: Send {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Reads from a byte stream. End of stream is an error.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Transfer for StreamReader<R> {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf).await? {
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the stream",
            )),
            n => Ok(n),
        }
    }
}

/// Writes to a byte stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transfer for StreamWriter<W> {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.write(buf).await? {
            0 => Err(io::ErrorKind::WriteZero.into()),
            n => Ok(n),
        }
    }
}

/// Receives datagrams on a connected UDP socket.
pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
}

impl UdpReceiver {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transfer for UdpReceiver {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

/// Sends datagrams on a connected UDP socket.
pub struct UdpSender {
    socket: Arc<UdpSocket>,
}

impl UdpSender {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transfer for UdpSender {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }
}

/// Sends datagrams from a shared socket to one peer until a deadline.
///
/// Used by the server for UDP peers, which have no transport of their own to
/// close: the deadline is checked on every call instead.
pub struct UdpSendTo {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    deadline: Instant,
}

impl UdpSendTo {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, deadline: Instant) -> Self {
        Self {
            socket,
            peer,
            deadline,
        }
    }
}

#[async_trait]
impl Transfer for UdpSendTo {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if Instant::now() >= self.deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer session duration elapsed",
            ));
        }
        self.socket.send_to(buf, self.peer).await
    }
}

/// Fails every call once its token is cancelled.
///
/// A call blocked in the inner transfer observes the cancellation and fails
/// with `ConnectionAborted`, the same as a transport closed underneath it.
pub struct Cancellable<T> {
    inner: T,
    token: CancellationToken,
}

impl<T> Cancellable<T> {
    pub fn new(inner: T, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

#[async_trait]
impl<T: Transfer> Transfer for Cancellable<T> {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            biased;

            _ = self.token.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )),

            res = self.inner.transfer(buf) => res,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Parameters of one transfer loop.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    /// Connection label used in log lines, e.g. `2/4`.
    pub label: String,
    pub role: Role,
    pub buf_size: usize,
    pub report_interval: Duration,
    /// Cap in mbps; zero means unlimited.
    pub max_speed: f64,
}

/// Outcome of one transfer loop: its lifetime summary and the periodic samples.
#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub summary: Summary,
    pub samples: Vec<Sample>,
    /// Slowest interval rate; `None` when no interval completed.
    pub min_mbps: Option<f64>,
    /// Fastest interval rate; `None` when no interval completed.
    pub max_mbps: Option<f64>,
}

/// Buffer of random bytes for writers. Filled once per task.
pub fn random_buffer(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill(&mut buf[..]);
    buf
}

/// Run `transfer` until it fails, then fold the lifetime average into
/// `aggregate`.
pub async fn run_loop<T: Transfer>(
    spec: LoopSpec,
    mut transfer: T,
    aggregate: Aggregate,
) -> LoopReport {
    let mut buf = match spec.role {
        Role::Reader => vec![0u8; spec.buf_size],
        Role::Writer => random_buffer(spec.buf_size),
    };
    let mut account = Account::new(Instant::now());
    let mut samples = Vec::new();
    let mut min_mbps: Option<f64> = None;
    let mut max_mbps: Option<f64> = None;

    debug!(
        conn = %spec.label,
        task = %spec.role,
        buf_size = spec.buf_size,
        max_speed = spec.max_speed,
        "transfer loop starting"
    );

    loop {
        tokio::task::yield_now().await;

        if spec.max_speed > 0.0 && account.window_mbps(Instant::now()) > spec.max_speed {
            tokio::time::sleep(THROTTLE_PAUSE).await;
            continue;
        }

        let n = match transfer.transfer(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(conn = %spec.label, task = %spec.role, error = %e, "transfer loop exiting");
                break;
            }
        };

        if let Some(report) = account.record(n, Instant::now(), spec.report_interval) {
            info!(
                conn = %spec.label,
                task = %spec.role,
                mbps = report.mbps as u64,
                rate = report.calls_per_sec as u64,
                unit = spec.role.rate_unit(),
                "report"
            );
            min_mbps = Some(min_mbps.map_or(report.mbps, |m| m.min(report.mbps)));
            max_mbps = Some(max_mbps.map_or(report.mbps, |m| m.max(report.mbps)));
            samples.push(Sample {
                at: Utc::now(),
                mbps: report.mbps,
            });
        }
    }

    let summary = account.summarize(spec.role, Instant::now());
    info!(
        conn = %spec.label,
        task = %spec.role,
        mbps = summary.avg_mbps as u64,
        rate = summary.avg_calls_per_sec as u64,
        unit = spec.role.rate_unit(),
        bytes = summary.bytes,
        "average"
    );
    aggregate.add(&summary).await;

    LoopReport {
        summary,
        samples,
        min_mbps,
        max_mbps,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
