//! TOML configuration for linkbench.
//!
//! A layered model: compiled-in defaults, an optional TOML file, then CLI
//! overrides applied by the binary. The result is a finished [`BenchConfig`]
//! that the client and server consume as-is.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::proto::{Options, MAX_BUFFER_SIZE};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LINKBENCH_CONFIG";

/// Config file looked up in the working directory.
const LOCAL_CONFIG_FILE: &str = "linkbench.toml";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bad duration {input:?}: {reason}")]
    BadDuration { input: String, reason: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not exceed {max} bytes")]
    TooLarge { field: &'static str, max: usize },

    #[error("max_speed must be a finite, non-negative number of mbps (got {0})")]
    BadMaxSpeed(f64),

    #[error("default_port {0:?} is not a port number")]
    BadPort(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Remote endpoints to dial; non-empty selects client mode.
    pub hosts: Vec<String>,
    /// Local addresses to listen on in server mode.
    pub listeners: Vec<String>,
    /// Port appended to hosts and listeners that carry none.
    pub default_port: String,
    /// Parallel connections per host.
    pub connections: usize,
    #[serde(with = "duration_str")]
    pub report_interval: Duration,
    #[serde(with = "duration_str")]
    pub total_duration: Duration,
    pub read_size: usize,
    pub write_size: usize,
    /// Suppress client-to-server writes.
    pub passive_client: bool,
    /// Ask the server to suppress server-to-client writes.
    pub passive_server: bool,
    /// Send-rate cap in mbps; `0` means unlimited.
    pub max_speed: f64,
    /// Use UDP instead of TCP/TLS.
    pub udp: bool,
    /// Local `address:port` bound for every dial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    /// Metadata forwarded to the server inside the options.
    pub table: BTreeMap<String, String>,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            listeners: vec![String::new()],
            default_port: ":8080".to_string(),
            connections: 1,
            report_interval: Duration::from_secs(2),
            total_duration: Duration::from_secs(10),
            read_size: 50_000,
            write_size: 50_000,
            passive_client: false,
            passive_server: false,
            max_speed: 0.0,
            udp: false,
            local_addr: None,
            table: BTreeMap::new(),
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `LINKBENCH_CONFIG` environment variable.
    /// 2. `./linkbench.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LINKBENCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(LOCAL_CONFIG_FILE);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// `true` when hosts are configured.
    pub fn is_client(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Default port in `:port` form.
    pub fn port_suffix(&self) -> String {
        if self.default_port.starts_with(':') {
            self.default_port.clone()
        } else {
            format!(":{}", self.default_port)
        }
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_client() && self.connections == 0 {
            return Err(ConfigError::Zero {
                field: "connections",
            });
        }
        if self.read_size == 0 {
            return Err(ConfigError::Zero { field: "read_size" });
        }
        if self.write_size == 0 {
            return Err(ConfigError::Zero {
                field: "write_size",
            });
        }
        for (field, size) in [("read_size", self.read_size), ("write_size", self.write_size)] {
            if size > MAX_BUFFER_SIZE {
                return Err(ConfigError::TooLarge {
                    field,
                    max: MAX_BUFFER_SIZE,
                });
            }
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "report_interval",
            });
        }
        if self.total_duration.is_zero() {
            return Err(ConfigError::Zero {
                field: "total_duration",
            });
        }
        if !self.max_speed.is_finite() || self.max_speed < 0.0 {
            return Err(ConfigError::BadMaxSpeed(self.max_speed));
        }
        let port = self.port_suffix();
        if port[1..].parse::<u16>().is_err() {
            return Err(ConfigError::BadPort(self.default_port.clone()));
        }
        Ok(())
    }

    /// Options a client sends to the server.
    pub fn options(&self) -> Options {
        Options {
            read_size: self.read_size,
            write_size: self.write_size,
            report_interval: self.report_interval,
            total_duration: self.total_duration,
            passive_server: self.passive_server,
            max_speed: self.max_speed,
            table: self.table.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// TLS settings. The client only looks at `enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM certificate chain used by the server.
    pub cert: PathBuf,
    /// PEM private key used by the server.
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a duration such as `2s`, `500ms`, `1.5m` or `3h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let bad = |reason: &str| ConfigError::BadDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(bad("empty"));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let micros_per_unit: u64 = match unit.trim() {
        "" | "s" => 1_000_000,
        "ms" => 1_000,
        "us" | "µs" => 1,
        "m" => 60_000_000,
        "h" => 3_600_000_000,
        _ => return Err(bad("unknown unit")),
    };

    // Whole numbers stay in integer arithmetic so they convert exactly.
    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(micros_per_unit)
            .map(Duration::from_micros)
            .ok_or_else(|| bad("out of range"));
    }

    let value: f64 = number.parse().map_err(|_| bad("not a number"))?;
    Duration::try_from_secs_f64(value * micros_per_unit as f64 / 1_000_000.0)
        .map_err(|_| bad("out of range"))
}

/// Render a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else if d.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}us", d.as_micros())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = BenchConfig::default();

        assert!(cfg.hosts.is_empty());
        assert!(!cfg.is_client());
        assert_eq!(cfg.listeners, vec![String::new()]);
        assert_eq!(cfg.default_port, ":8080");
        assert_eq!(cfg.connections, 1);
        assert_eq!(cfg.report_interval, Duration::from_secs(2));
        assert_eq!(cfg.total_duration, Duration::from_secs(10));
        assert_eq!(cfg.read_size, 50_000);
        assert_eq!(cfg.write_size, 50_000);
        assert!(!cfg.passive_client);
        assert!(!cfg.passive_server);
        assert_eq!(cfg.max_speed, 0.0);
        assert!(!cfg.udp);
        assert!(cfg.tls.enabled);
        assert_eq!(cfg.tls.cert, PathBuf::from("cert.pem"));
        assert_eq!(cfg.tls.key, PathBuf::from("key.pem"));
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
hosts = ["10.0.0.1", "[fe80::1]:9000"]
default_port = "9090"
connections = 4
report_interval = "500ms"
total_duration = 30
read_size = 1000
write_size = 2000
passive_server = true
max_speed = 100.5
udp = true
local_addr = "10.0.0.2:0"

[table]
site = "lab-a"

[tls]
enabled = false
cert = "/etc/linkbench/cert.pem"
key = "/etc/linkbench/key.pem"

[logging]
level = "debug"
json = true
"#;

        let cfg: BenchConfig = toml::from_str(toml_str).unwrap();

        assert!(cfg.is_client());
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(cfg.port_suffix(), ":9090");
        assert_eq!(cfg.connections, 4);
        assert_eq!(cfg.report_interval, Duration::from_millis(500));
        assert_eq!(cfg.total_duration, Duration::from_secs(30));
        assert_eq!(cfg.read_size, 1000);
        assert_eq!(cfg.write_size, 2000);
        assert!(cfg.passive_server);
        assert_eq!(cfg.max_speed, 100.5);
        assert!(cfg.udp);
        assert_eq!(cfg.local_addr.as_deref(), Some("10.0.0.2:0"));
        assert_eq!(cfg.table.get("site").map(String::as_str), Some("lab-a"));
        assert!(!cfg.tls.enabled);
        assert_eq!(cfg.tls.cert, PathBuf::from("/etc/linkbench/cert.pem"));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: BenchConfig = toml::from_str("").unwrap();
        let defaults = BenchConfig::default();

        assert_eq!(cfg.default_port, defaults.default_port);
        assert_eq!(cfg.total_duration, defaults.total_duration);
        assert_eq!(cfg.listeners, defaults.listeners);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("linkbench.toml");
        std::fs::write(&path, "connections = 3\ntotal_duration = \"1m\"\n").unwrap();

        let cfg = BenchConfig::load(&path).unwrap();
        assert_eq!(cfg.connections, 3);
        assert_eq!(cfg.total_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = BenchConfig::load(Path::new("/nonexistent/path/linkbench.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_duration_in_file_errors() {
        let result: std::result::Result<BenchConfig, _> =
            toml::from_str("report_interval = \"soon\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut cfg = BenchConfig::default();
        cfg.report_interval = Duration::from_millis(250);
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: BenchConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.report_interval, roundtripped.report_interval);
        assert_eq!(cfg.total_duration, roundtripped.total_duration);
        assert_eq!(cfg.default_port, roundtripped.default_port);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 10 ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10 fortnights").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_format_duration_round_trips() {
        for d in [
            Duration::from_secs(7),
            Duration::from_millis(1500),
            Duration::from_micros(1_000_250),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let client = BenchConfig {
            hosts: vec!["localhost".to_string()],
            ..BenchConfig::default()
        };

        let mut cfg = client.clone();
        cfg.connections = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "connections"
            })
        );

        let mut cfg = client.clone();
        cfg.write_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = client.clone();
        cfg.read_size = MAX_BUFFER_SIZE + 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::TooLarge {
                field: "read_size",
                max: MAX_BUFFER_SIZE
            })
        );

        let mut cfg = client.clone();
        cfg.total_duration = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = client.clone();
        cfg.max_speed = -1.0;
        assert_eq!(cfg.validate(), Err(ConfigError::BadMaxSpeed(-1.0)));

        let mut cfg = client;
        cfg.default_port = ":http".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::BadPort(_))));
    }

    #[test]
    fn test_server_ignores_connection_count() {
        let cfg = BenchConfig {
            connections: 0,
            ..BenchConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_options_mirror_config() {
        let mut cfg = BenchConfig::default();
        cfg.passive_server = true;
        cfg.max_speed = 8.0;
        cfg.table.insert("k".to_string(), "v".to_string());

        let opt = cfg.options();
        assert_eq!(opt.read_size, cfg.read_size);
        assert_eq!(opt.write_size, cfg.write_size);
        assert_eq!(opt.report_interval, cfg.report_interval);
        assert_eq!(opt.total_duration, cfg.total_duration);
        assert!(opt.passive_server);
        assert_eq!(opt.max_speed, 8.0);
        assert_eq!(opt.table, cfg.table);
    }
}
