//! Throughput measurement: per-task accounting, the rate-controlled transfer
//! loop and result formatting.

pub mod account;
pub mod engine;
pub mod report;

pub use account::{Account, Aggregate, Aggregates, Role, Sample, Summary, Totals};
pub use engine::{run_loop, LoopReport, LoopSpec, Transfer};
