//! Throughput result formatting.

use serde::Serialize;

use super::account::{Role, Totals};
use super::engine::LoopReport;
use crate::connection::ConnectionReport;

/// Everything a client run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub connections: Vec<ConnectionReport>,
    pub reader: Totals,
    pub writer: Totals,
}

/// Format a rate in mbps, switching to Gbps from 1000 up.
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

fn format_loop(report: &LoopReport) -> String {
    let summary = &report.summary;
    let mut line = format!(
        "{} {} ({:.0} {}",
        summary.role,
        format_speed(summary.avg_mbps),
        summary.avg_calls_per_sec,
        summary.role.rate_unit(),
    );
    if let (Some(min), Some(max)) = (report.min_mbps, report.max_mbps) {
        line.push_str(&format!(", min {}, max {}", format_speed(min), format_speed(max)));
    }
    line.push(')');
    line
}

/// One line per connection.
pub fn format_connection(report: &ConnectionReport) -> String {
    let mut line = format!(
        "{} {} {}: {}",
        report.label,
        report.remote,
        report.transport,
        format_loop(&report.reader),
    );
    if let Some(writer) = &report.writer {
        line.push_str(", ");
        line.push_str(&format_loop(writer));
    }
    line
}

/// One line for a role aggregate.
pub fn format_totals(role: Role, totals: &Totals) -> String {
    let direction = match role {
        Role::Reader => "reading",
        Role::Writer => "writing",
    };
    format!(
        "aggregate {}: {} {:.0} {} ({} task{})",
        direction,
        format_speed(totals.mbps),
        totals.calls_per_sec,
        role.rate_unit(),
        totals.contributions,
        if totals.contributions == 1 { "" } else { "s" },
    )
}

/// Format a run as a human-readable, multi-line summary.
pub fn format_summary(run: &RunSummary) -> String {
    let mut lines: Vec<String> = run.connections.iter().map(format_connection).collect();
    if run.connections.is_empty() {
        lines.push("no connection established".to_string());
    }
    lines.push(format_totals(Role::Reader, &run.reader));
    lines.push(format_totals(Role::Writer, &run.writer));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::throughput::account::Summary;
    use crate::transport::TransportKind;

    fn loop_report(role: Role, avg_mbps: f64) -> LoopReport {
        LoopReport {
            summary: Summary {
                role,
                bytes: 1,
                calls: 1,
                elapsed: Duration::from_secs(10),
                avg_mbps,
                avg_calls_per_sec: 42.0,
            },
            samples: Vec::new(),
            min_mbps: None,
            max_mbps: None,
        }
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(9412.0), "9.41 Gbps");
        assert_eq!(format_speed(245.3), "245.3 Mbps");
        assert_eq!(format_speed(0.0), "0.0 Mbps");
    }

    #[test]
    fn test_format_summary() {
        let run = RunSummary {
            connections: vec![ConnectionReport {
                label: "1/1".to_string(),
                remote: "127.0.0.1:8080".to_string(),
                transport: TransportKind::Tls,
                reader: loop_report(Role::Reader, 245.3),
                writer: Some(loop_report(Role::Writer, 9412.0)),
            }],
            reader: Totals {
                mbps: 245.3,
                calls_per_sec: 42.0,
                contributions: 1,
            },
            writer: Totals::default(),
        };

        let text = format_summary(&run);
        assert!(text.contains("1/1 127.0.0.1:8080 TLS: reader 245.3 Mbps (42 rcv/s)"));
        assert!(text.contains("writer 9.41 Gbps (42 snd/s)"));
        assert!(text.contains("aggregate reading: 245.3 Mbps 42 rcv/s (1 task)"));
        assert!(text.contains("aggregate writing: 0.0 Mbps 0 snd/s (0 tasks)"));
    }

    #[test]
    fn test_format_loop_with_interval_range() {
        let report = LoopReport {
            min_mbps: Some(7.5),
            max_mbps: Some(1250.0),
            ..loop_report(Role::Writer, 8.0)
        };
        assert_eq!(
            format_loop(&report),
            "writer 8.0 Mbps (42 snd/s, min 7.5 Mbps, max 1.25 Gbps)"
        );
    }

    #[test]
    fn test_format_summary_without_connections() {
        let run = RunSummary {
            connections: Vec::new(),
            reader: Totals::default(),
            writer: Totals::default(),
        };
        assert!(format_summary(&run).starts_with("no connection established"));
    }
}
