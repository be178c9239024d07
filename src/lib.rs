//! linkbench -- parallel TCP/TLS/UDP throughput benchmark.
//!
//! A run is either a client, which dials one or more hosts with N parallel
//! connections, or a server, which accepts them. Each connection exchanges
//! [`proto::Options`] and then floods data in one or both directions for the
//! negotiated duration while [`throughput`] accounts the achieved rates.

pub mod client;
pub mod config;
pub mod connection;
pub mod proto;
pub mod server;
pub mod session;
pub mod throughput;
pub mod transport;

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
