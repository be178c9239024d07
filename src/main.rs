use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use linkbench::client::Client;
use linkbench::config::{format_duration, parse_duration, BenchConfig};
use linkbench::proto::cert::generate_self_signed;
use linkbench::server::Server;
use linkbench::throughput::report::format_summary;

#[derive(Parser)]
#[command(
    name = "linkbench",
    about = "Parallel TCP/TLS/UDP throughput benchmark",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a self-signed TLS certificate and key for server mode
    GenCert {
        /// Certificate output path
        #[arg(long, default_value = "cert.pem")]
        cert: PathBuf,

        /// Private key output path
        #[arg(long, default_value = "key.pem")]
        key: PathBuf,

        /// Subject name (repeatable)
        #[arg(long = "name", default_value = "localhost")]
        names: Vec<String>,
    },
}

/// Benchmark flags. Each one overrides the config file value.
#[derive(Args)]
struct RunArgs {
    /// TOML config file (default: $LINKBENCH_CONFIG, then ./linkbench.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hosts to dial; selects client mode
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Addresses to listen on in server mode
    #[arg(long, value_delimiter = ',')]
    listeners: Vec<String>,

    /// Port used when a host or listener carries none
    #[arg(long)]
    default_port: Option<String>,

    /// Parallel connections per host
    #[arg(long)]
    connections: Option<usize>,

    /// Interval between periodic reports (e.g. 2s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    report_interval: Option<Duration>,

    /// Test duration (e.g. 10s, 1m)
    #[arg(long, value_parser = parse_duration)]
    total_duration: Option<Duration>,

    /// Read buffer size in bytes
    #[arg(long)]
    read_size: Option<usize>,

    /// Write buffer size in bytes
    #[arg(long)]
    write_size: Option<usize>,

    /// Do not send data to the server
    #[arg(long)]
    passive_client: bool,

    /// Ask the server not to send data back
    #[arg(long)]
    passive_server: bool,

    /// Send-rate cap in mbps (0 = unlimited)
    #[arg(long)]
    max_speed: Option<f64>,

    /// Use UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// Enable or disable TLS (true/false)
    #[arg(long, action = ArgAction::Set)]
    tls: Option<bool>,

    /// TLS certificate for server mode
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key for server mode
    #[arg(long)]
    key: Option<PathBuf>,

    /// Local address bound for every dial
    #[arg(long)]
    local_addr: Option<String>,

    /// Metadata sent to the server as key=value (repeatable)
    #[arg(long = "table", value_parser = parse_table_entry)]
    table: Vec<(String, String)>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the client run summary as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(self, config: &mut BenchConfig) {
        if !self.hosts.is_empty() {
            config.hosts = self.hosts;
        }
        if !self.listeners.is_empty() {
            config.listeners = self.listeners;
        }
        if let Some(v) = self.default_port {
            config.default_port = v;
        }
        if let Some(v) = self.connections {
            config.connections = v;
        }
        if let Some(v) = self.report_interval {
            config.report_interval = v;
        }
        if let Some(v) = self.total_duration {
            config.total_duration = v;
        }
        if let Some(v) = self.read_size {
            config.read_size = v;
        }
        if let Some(v) = self.write_size {
            config.write_size = v;
        }
        config.passive_client |= self.passive_client;
        config.passive_server |= self.passive_server;
        if let Some(v) = self.max_speed {
            config.max_speed = v;
        }
        config.udp |= self.udp;
        if let Some(v) = self.tls {
            config.tls.enabled = v;
        }
        if let Some(v) = self.cert {
            config.tls.cert = v;
        }
        if let Some(v) = self.key {
            config.tls.key = v;
        }
        if self.local_addr.is_some() {
            config.local_addr = self.local_addr;
        }
        config.table.extend(self.table);
        if let Some(v) = self.log_level {
            config.logging.level = v;
        }
        config.logging.json |= self.log_json;
    }
}

fn parse_table_entry(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(level: &str, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load the configuration under a scoped subscriber built from the CLI log
/// flags, so load diagnostics are not lost before the final logging setup.
fn load_config(run: &RunArgs) -> Result<BenchConfig> {
    let load = || match &run.config {
        Some(path) => BenchConfig::load(path),
        None => Ok(BenchConfig::load_or_default()),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(run.log_level.as_deref().unwrap_or("info")))
        .with_writer(std::io::stderr);
    if run.log_json {
        tracing::subscriber::with_default(builder.json().finish(), load)
    } else {
        tracing::subscriber::with_default(builder.finish(), load)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::GenCert { cert, key, names }) = cli.command {
        init_tracing("info", cli.run.log_json);
        let pair = generate_self_signed(&names)?;
        pair.write(&cert, &key)?;
        println!("wrote {} and {}", cert.display(), key.display());
        return Ok(());
    }

    let mut config = load_config(&cli.run)?;
    let json_summary = cli.run.json;
    cli.run.apply(&mut config);
    config.validate().context("invalid configuration")?;

    init_tracing(&config.logging.level, config.logging.json);

    let mode = if config.is_client() { "client" } else { "server" };
    info!(
        version = linkbench::VERSION,
        mode,
        connections = config.connections,
        hosts = ?config.hosts,
        listeners = ?config.listeners,
        report_interval = %format_duration(config.report_interval),
        total_duration = %format_duration(config.total_duration),
        udp = config.udp,
        tls = config.tls.enabled,
        "linkbench starting"
    );

    if config.is_client() {
        let summary = Client::new(config).run().await?;
        if json_summary {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("{}", format_summary(&summary));
        }
    } else {
        let server = Server::bind(&config).await?;
        let shutdown = server.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping listeners");
                shutdown.cancel();
            }
        });
        server.run().await?;
    }

    Ok(())
}
