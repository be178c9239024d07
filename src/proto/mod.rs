//! Handshake protocol shared by the benchmark client and server.
//!
//! A connection starts with the client sending its [`Options`]; stream
//! transports answer with an [`Ack`] before either side starts flooding.
//! Both messages travel inside the tagged [`Handshake`] envelope, framed by
//! [`wire`].

pub mod cert;
pub mod tls;
pub mod wire;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version carried in every [`Ack`]. Bumped whenever the envelope changes.
pub const PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Test parameters negotiated once per connection.
///
/// Built by the initiating side from its configuration and immutable for the
/// life of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Read buffer size in bytes.
    pub read_size: usize,
    /// Write buffer size in bytes.
    pub write_size: usize,
    /// Period between interval reports.
    pub report_interval: Duration,
    /// Total test duration.
    pub total_duration: Duration,
    /// Suppress server-to-client writes.
    pub passive_server: bool,
    /// Send-rate cap in megabits per second; `0` means unlimited.
    pub max_speed: f64,
    /// Free-form metadata supplied by the client.
    #[serde(default)]
    pub table: BTreeMap<String, String>,
}

/// Stream-only acknowledgment sent by the server after it accepted the options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub version: u16,
}

impl Ack {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }
}

/// Largest read or write buffer a peer may ask for.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

impl Options {
    /// Reject options a server cannot run with.
    pub fn check(&self) -> Result<(), HandshakeError> {
        if self.read_size == 0 || self.write_size == 0 {
            return Err(HandshakeError::InvalidOptions("zero buffer size"));
        }
        if self.read_size > MAX_BUFFER_SIZE || self.write_size > MAX_BUFFER_SIZE {
            return Err(HandshakeError::InvalidOptions("buffer size above 16 MiB"));
        }
        if self.report_interval.is_zero() || self.total_duration.is_zero() {
            return Err(HandshakeError::InvalidOptions("zero interval or duration"));
        }
        if !self.max_speed.is_finite() || self.max_speed < 0.0 {
            return Err(HandshakeError::InvalidOptions("max speed out of range"));
        }
        Ok(())
    }
}

impl Default for Ack {
    fn default() -> Self {
        Self::new()
    }
}

/// Envelope for every handshake frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handshake {
    Options(Options),
    Ack(Ack),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed handshake payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("handshake frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("handshake datagram length mismatch: prefix announces {announced} bytes, got {actual}")]
    LengthMismatch { announced: usize, actual: usize },

    #[error("expected {expected} message, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("peer speaks protocol version {got}, expected {expected}")]
    VersionMismatch { got: u16, expected: u16 },

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("unusable options: {0}")]
    InvalidOptions(&'static str),
}

impl Handshake {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Handshake::Options(_) => "options",
            Handshake::Ack(_) => "ack",
        }
    }
}
