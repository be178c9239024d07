//! Per-task accounting and cross-connection aggregates.
//!
//! An [`Account`] is owned by exactly one reader or writer task. It keeps
//! cumulative byte and call counters plus the snapshot taken at the last
//! periodic report. When the task ends its lifetime [`Summary`] is folded
//! into the role's shared [`Aggregate`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Rates
// ---------------------------------------------------------------------------

/// Megabits per second for `bytes` moved over `elapsed`.
///
/// Zero elapsed time yields `0.0` rather than infinity.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (8 * bytes) as f64 / (1_000_000.0 * secs)
    } else {
        0.0
    }
}

fn per_sec(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Transfer direction of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    /// Unit used for the call rate in log lines.
    pub fn rate_unit(self) -> &'static str {
        match self {
            Role::Reader => "rcv/s",
            Role::Writer => "snd/s",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Rates over one report window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalReport {
    pub mbps: f64,
    pub calls_per_sec: f64,
    pub bytes: u64,
    pub calls: u64,
}

/// One chart point: when a report was taken and the rate it measured.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub mbps: f64,
}

/// Lifetime averages of one task.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub role: Role,
    pub bytes: u64,
    pub calls: u64,
    pub elapsed: Duration,
    pub avg_mbps: f64,
    pub avg_calls_per_sec: f64,
}

/// Running counters of one reader or writer task.
///
/// Counters only grow and the report snapshot never runs ahead of them.
#[derive(Debug, Clone)]
pub struct Account {
    start: Instant,
    prev_time: Instant,
    prev_bytes: u64,
    prev_calls: u64,
    bytes: u64,
    calls: u64,
}

impl Account {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            prev_time: start,
            prev_bytes: 0,
            prev_calls: 0,
            bytes: 0,
            calls: 0,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Count one transfer of `n` bytes.
    ///
    /// Returns the window's rates when more than `report_interval` has passed
    /// since the last report, and starts a new window.
    pub fn record(
        &mut self,
        n: usize,
        now: Instant,
        report_interval: Duration,
    ) -> Option<IntervalReport> {
        self.calls += 1;
        self.bytes += n as u64;

        let elapsed = now.saturating_duration_since(self.prev_time);
        if elapsed <= report_interval {
            return None;
        }

        let bytes = self.bytes - self.prev_bytes;
        let calls = self.calls - self.prev_calls;
        let report = IntervalReport {
            mbps: mbps(bytes, elapsed),
            calls_per_sec: per_sec(calls, elapsed),
            bytes,
            calls,
        };

        self.prev_time = now;
        self.prev_bytes = self.bytes;
        self.prev_calls = self.calls;

        Some(report)
    }

    /// Bit rate of the current report window, in mbps.
    ///
    /// A window that already moved bytes but has no measurable elapsed time
    /// reports `f64::INFINITY`.
    pub fn window_mbps(&self, now: Instant) -> f64 {
        let bytes = self.bytes - self.prev_bytes;
        let elapsed = now.saturating_duration_since(self.prev_time);
        if elapsed.is_zero() {
            return if bytes == 0 { 0.0 } else { f64::INFINITY };
        }
        mbps(bytes, elapsed)
    }

    /// Lifetime averages from the start of the account until `now`.
    pub fn summarize(&self, role: Role, now: Instant) -> Summary {
        let elapsed = now.saturating_duration_since(self.start);
        Summary {
            role,
            bytes: self.bytes,
            calls: self.calls,
            elapsed,
            avg_mbps: mbps(self.bytes, elapsed),
            avg_calls_per_sec: per_sec(self.calls, elapsed),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Sum of the averages contributed to an [`Aggregate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub mbps: f64,
    pub calls_per_sec: f64,
    pub contributions: u64,
}

/// Cross-connection running total for one role.
///
/// Cheap to clone; every clone updates the same totals under one lock.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    inner: Arc<Mutex<Totals>>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, summary: &Summary) {
        let mut totals = self.inner.lock().await;
        totals.mbps += summary.avg_mbps;
        totals.calls_per_sec += summary.avg_calls_per_sec;
        totals.contributions += 1;
    }

    pub async fn snapshot(&self) -> Totals {
        *self.inner.lock().await
    }
}

/// Reader and writer aggregates of one process run.
#[derive(Debug, Clone, Default)]
pub struct Aggregates {
    pub reader: Aggregate,
    pub writer: Aggregate,
}

impl Aggregates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_role(&self, role: Role) -> &Aggregate {
        match role {
            Role::Reader => &self.reader,
            Role::Writer => &self.writer,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(avg_mbps: f64, avg_calls_per_sec: f64) -> Summary {
        Summary {
            role: Role::Reader,
            bytes: 0,
            calls: 0,
            elapsed: Duration::from_secs(1),
            avg_mbps,
            avg_calls_per_sec,
        }
    }

    #[test]
    fn test_mbps_formula() {
        // 1_000_000 bytes in one second is 8 megabits per second.
        assert_eq!(mbps(1_000_000, Duration::from_secs(1)), 8.0);
        assert_eq!(mbps(500_000, Duration::from_millis(500)), 8.0);
        assert_eq!(mbps(123, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_counters_independent_of_report_timing() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);

        for step_ms in [0u64, 1, 7, 150, 1_000] {
            let mut acc = Account::new(start);
            for i in 0..250u64 {
                let now = start + Duration::from_millis(i * step_ms);
                acc.record(1_400, now, interval);
            }
            assert_eq!(acc.calls(), 250, "step {}ms", step_ms);
            assert_eq!(acc.bytes(), 250 * 1_400, "step {}ms", step_ms);
        }
    }

    #[test]
    fn test_report_emitted_after_interval() {
        let start = Instant::now();
        let interval = Duration::from_secs(1);
        let mut acc = Account::new(start);

        assert!(acc
            .record(1_000, start + Duration::from_millis(500), interval)
            .is_none());
        // Exactly one interval is not yet "more than" the interval.
        assert!(acc
            .record(1_000, start + Duration::from_secs(1), interval)
            .is_none());

        let report = acc
            .record(1_000, start + Duration::from_millis(2_000), interval)
            .expect("window should close");
        assert_eq!(report.bytes, 3_000);
        assert_eq!(report.calls, 3);
        assert!((report.mbps - 0.012).abs() < 1e-9);
        assert!((report.calls_per_sec - 1.5).abs() < 1e-9);

        // The next window starts from the snapshot.
        let report = acc
            .record(4_000, start + Duration::from_millis(3_001), interval)
            .expect("second window should close");
        assert_eq!(report.bytes, 4_000);
        assert_eq!(report.calls, 1);
    }

    #[test]
    fn test_window_rate() {
        let start = Instant::now();
        let mut acc = Account::new(start);
        assert_eq!(acc.window_mbps(start), 0.0);

        acc.record(1_000, start, Duration::from_secs(10));
        assert_eq!(acc.window_mbps(start), f64::INFINITY);
        assert_eq!(acc.window_mbps(start + Duration::from_millis(1)), 8.0);
    }

    #[test]
    fn test_summary_uses_lifetime() {
        let start = Instant::now();
        let mut acc = Account::new(start);
        let interval = Duration::from_millis(10);
        for i in 1..=4u64 {
            acc.record(250_000, start + Duration::from_millis(i * 250), interval);
        }

        let summary = acc.summarize(Role::Writer, start + Duration::from_secs(2));
        assert_eq!(summary.role, Role::Writer);
        assert_eq!(summary.bytes, 1_000_000);
        assert_eq!(summary.calls, 4);
        assert_eq!(summary.avg_mbps, 4.0);
        assert_eq!(summary.avg_calls_per_sec, 2.0);
    }

    #[test]
    fn test_summary_of_idle_account() {
        let start = Instant::now();
        let acc = Account::new(start);
        let summary = acc.summarize(Role::Reader, start);
        assert_eq!(summary.bytes, 0);
        assert_eq!(summary.avg_mbps, 0.0);
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(Role::Reader.rate_unit(), "rcv/s");
        assert_eq!(Role::Writer.rate_unit(), "snd/s");
        assert_eq!(Role::Writer.to_string(), "writer");
    }

    #[tokio::test]
    async fn test_aggregate_sums_contributions() {
        let agg = Aggregate::new();
        agg.add(&summary(10.0, 100.0)).await;
        agg.add(&summary(2.5, 5.0)).await;

        let totals = agg.snapshot().await;
        assert_eq!(totals.mbps, 12.5);
        assert_eq!(totals.calls_per_sec, 105.0);
        assert_eq!(totals.contributions, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aggregate_concurrent_contributions() {
        let agg = Aggregate::new();
        let mut tasks = tokio::task::JoinSet::new();

        // Rates are multiples of 0.5 so every partial sum is exact.
        for i in 0..200u64 {
            let agg = agg.clone();
            tasks.spawn(async move {
                tokio::task::yield_now().await;
                agg.add(&summary(i as f64 * 0.5, 1.0)).await;
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        let expected: f64 = (0..200u64).map(|i| i as f64 * 0.5).sum();
        let totals = agg.snapshot().await;
        assert_eq!(totals.mbps, expected);
        assert_eq!(totals.calls_per_sec, 200.0);
        assert_eq!(totals.contributions, 200);
    }

    #[test]
    fn test_aggregates_by_role() {
        let aggs = Aggregates::new();
        assert!(std::ptr::eq(aggs.for_role(Role::Reader), &aggs.reader));
        assert!(std::ptr::eq(aggs.for_role(Role::Writer), &aggs.writer));
    }
}
