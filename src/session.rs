//! UDP session table.
//!
//! UDP has no connections, so the server rebuilds them from source addresses.
//! The first datagram from an unknown address carries the peer's options and
//! opens a session; later datagrams are accounted against it until its total
//! duration has elapsed, at which point the session is finalized exactly
//! once. A periodic sweep finalizes sessions that went quiet before expiring
//! and evicts finished ones after a linger period.
//!
//! The table is owned by the single receive task of its socket and needs no
//! lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proto::wire::decode_options_datagram;
use crate::proto::{HandshakeError, Options};
use crate::throughput::account::{Account, Aggregates, IntervalReport, Role, Summary};
use crate::throughput::engine::{run_loop, LoopReport, LoopSpec, UdpSendTo};

/// Period of the finalize/evict sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long a finished session must stay quiet before it is evicted.
pub const LINGER: Duration = Duration::from_secs(5);

/// Smallest receive buffer, so an options datagram always fits.
pub const MIN_RECV_BUFFER: usize = 65_536;

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SessionEntry {
    id: usize,
    /// `None` when the first datagram did not decode; the session is abandoned.
    options: Option<Options>,
    account: Account,
    start: Instant,
    last_seen: Instant,
    finalized: bool,
}

impl SessionEntry {
    /// Finalize against the session deadline, not the time we noticed it.
    fn finalize(&mut self, options: &Options, now: Instant) -> Summary {
        self.finalized = true;
        let end = now.min(self.start + options.total_duration);
        self.account.summarize(Role::Reader, end)
    }
}

/// Outcome of one inbound datagram.
#[derive(Debug)]
pub enum Dispatch {
    /// First datagram of a new peer, carrying its options.
    NewPeer { id: usize, options: Options },
    /// First datagram of a new peer did not decode; the session is abandoned.
    Rejected { id: usize, error: HandshakeError },
    /// Datagram counted; `report` is set when a report window closed.
    Accounted {
        id: usize,
        report: Option<IntervalReport>,
    },
    /// The session's duration has elapsed; this is its single final summary.
    Expired { id: usize, summary: Summary },
    /// Datagram from a finalized or abandoned session.
    Ignored { id: usize },
}

/// A session finalized by [`SessionTable::sweep`] or [`SessionTable::finalize_all`].
#[derive(Debug)]
pub struct Finalized {
    pub id: usize,
    pub peer: SocketAddr,
    pub summary: Summary,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    entries: HashMap<SocketAddr, SessionEntry>,
    next_id: usize,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.entries.contains_key(peer)
    }

    /// Route one datagram from `src` received at `now`.
    pub fn dispatch(&mut self, src: SocketAddr, datagram: &[u8], now: Instant) -> Dispatch {
        let entry = match self.entries.get_mut(&src) {
            Some(entry) => entry,
            None => return self.open(src, datagram, now),
        };
        entry.last_seen = now;

        let options = match &entry.options {
            Some(options) if !entry.finalized => options.clone(),
            _ => return Dispatch::Ignored { id: entry.id },
        };

        if now.saturating_duration_since(entry.start) >= options.total_duration {
            let summary = entry.finalize(&options, now);
            return Dispatch::Expired {
                id: entry.id,
                summary,
            };
        }

        let report = entry
            .account
            .record(datagram.len(), now, options.report_interval);
        Dispatch::Accounted {
            id: entry.id,
            report,
        }
    }

    fn open(&mut self, src: SocketAddr, datagram: &[u8], now: Instant) -> Dispatch {
        let id = self.next_id;
        self.next_id += 1;

        let decoded = decode_options_datagram(datagram);
        self.entries.insert(
            src,
            SessionEntry {
                id,
                options: decoded.as_ref().ok().cloned(),
                account: Account::new(now),
                start: now,
                last_seen: now,
                finalized: false,
            },
        );

        match decoded {
            Ok(options) => Dispatch::NewPeer { id, options },
            Err(error) => Dispatch::Rejected { id, error },
        }
    }

    /// Finalize sessions that expired without a further datagram and evict
    /// finished sessions that stayed quiet for [`LINGER`].
    pub fn sweep(&mut self, now: Instant) -> Vec<Finalized> {
        let mut finalized = Vec::new();
        for (peer, entry) in self.entries.iter_mut() {
            let Some(options) = entry.options.clone() else {
                continue;
            };
            if !entry.finalized
                && now.saturating_duration_since(entry.start) >= options.total_duration
            {
                finalized.push(Finalized {
                    id: entry.id,
                    peer: *peer,
                    summary: entry.finalize(&options, now),
                });
            }
        }

        self.entries.retain(|peer, entry| {
            let done = entry.finalized || entry.options.is_none();
            let keep = !done || now.saturating_duration_since(entry.last_seen) < LINGER;
            if !keep {
                debug!(peer = %peer, id = entry.id, "evicting UDP session");
            }
            keep
        });

        finalized
    }

    /// Finalize every live session, e.g. on shutdown.
    pub fn finalize_all(&mut self, now: Instant) -> Vec<Finalized> {
        let mut finalized = Vec::new();
        for (peer, entry) in self.entries.iter_mut() {
            if entry.finalized {
                continue;
            }
            if let Some(options) = entry.options.clone() {
                finalized.push(Finalized {
                    id: entry.id,
                    peer: *peer,
                    summary: entry.finalize(&options, now),
                });
            }
        }
        finalized
    }
}

// ---------------------------------------------------------------------------
// Listener loop
// ---------------------------------------------------------------------------

fn label(id: usize) -> String {
    format!("#{}", id)
}

fn log_average(id: usize, summary: &Summary) {
    info!(
        conn = %label(id),
        task = %Role::Reader,
        mbps = summary.avg_mbps as u64,
        rate = summary.avg_calls_per_sec as u64,
        unit = Role::Reader.rate_unit(),
        bytes = summary.bytes,
        "average"
    );
}

/// Receive loop of one UDP listen socket.
///
/// Runs until `shutdown` is cancelled, then finalizes the remaining sessions
/// and waits for their writers.
pub async fn run_udp_listener(
    socket: UdpSocket,
    read_size: usize,
    aggregates: Aggregates,
    shutdown: CancellationToken,
) {
    let socket = Arc::new(socket);
    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let mut buf = vec![0u8; read_size.max(MIN_RECV_BUFFER)];
    let mut table = SessionTable::new();
    let mut writers: JoinSet<LoopReport> = JoinSet::new();

    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(addr = %local, "UDP listener started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = sweep.tick() => {
                for done in table.sweep(Instant::now()) {
                    debug!(peer = %done.peer, conn = %label(done.id), "UDP session expired quietly");
                    log_average(done.id, &done.summary);
                    aggregates.reader.add(&done.summary).await;
                }
                while let Some(res) = writers.try_join_next() {
                    if let Err(e) = res {
                        warn!(error = %e, "UDP writer task failed");
                    }
                }
            }

            res = socket.recv_from(&mut buf) => {
                let (n, src) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(addr = %local, error = %e, "UDP read error");
                        continue;
                    }
                };

                match table.dispatch(src, &buf[..n], Instant::now()) {
                    Dispatch::NewPeer { id, options } => {
                        info!(peer = %src, conn = %label(id), ?options, "UDP options received");
                        if options.passive_server {
                            continue;
                        }
                        let spec = LoopSpec {
                            label: label(id),
                            role: Role::Writer,
                            buf_size: options.write_size,
                            report_interval: options.report_interval,
                            max_speed: options.max_speed,
                        };
                        let deadline = Instant::now() + options.total_duration;
                        let sender = UdpSendTo::new(socket.clone(), src, deadline);
                        writers.spawn(run_loop(spec, sender, aggregates.writer.clone()));
                    }
                    Dispatch::Rejected { id, error } => {
                        warn!(peer = %src, conn = %label(id), error = %error, "UDP options failure, session abandoned");
                    }
                    Dispatch::Accounted { id, report: Some(report) } => {
                        info!(
                            conn = %label(id),
                            task = %Role::Reader,
                            mbps = report.mbps as u64,
                            rate = report.calls_per_sec as u64,
                            unit = Role::Reader.rate_unit(),
                            "report"
                        );
                    }
                    Dispatch::Accounted { report: None, .. } => {}
                    Dispatch::Expired { id, summary } => {
                        info!(peer = %src, conn = %label(id), "UDP session duration elapsed");
                        log_average(id, &summary);
                        aggregates.reader.add(&summary).await;
                    }
                    Dispatch::Ignored { .. } => {}
                }
            }
        }
    }

    for done in table.finalize_all(Instant::now()) {
        log_average(done.id, &done.summary);
        aggregates.reader.add(&done.summary).await;
    }
    while let Some(res) = writers.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "UDP writer task failed");
        }
    }
    info!(addr = %local, "UDP listener stopped");
}
