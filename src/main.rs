use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use mcstat::config::{Config, Overrides};
use mcstat::domain::Channel;
use mcstat::health::HealthMetrics;
use mcstat::net;
use mcstat::pipeline::Pipeline;
use mcstat::shutdown::ShutdownSignal;
use mcstat::sink::{self, ClickHouseSink, ConsoleSink, SinkExit};

/// Multicast channel bitrate and packet-rate monitor.
#[derive(Parser)]
#[command(name = "mcstat", about, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print metrics to standard output.
    #[arg(short = 's', long)]
    console: bool,

    /// Write metrics to ClickHouse.
    #[arg(short = 'd', long)]
    database: bool,

    /// Measurement interval in seconds.
    #[arg(short = 'n', long, value_name = "SECS")]
    interval: Option<u64>,

    /// Shorthand for --log-level debug.
    #[arg(short, long)]
    verbose: bool,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Channels to monitor, as multicast ip:port.
    #[arg(value_name = "ADDR")]
    channels: Vec<Channel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let log_level = self
            .log_level
            .clone()
            .or_else(|| self.verbose.then(|| "debug".to_string()));

        Overrides {
            log_level,
            interval: self.interval.map(Duration::from_secs),
            channels: self.channels.clone(),
            console: self.console,
            clickhouse: self.database,
        }
    }
}

/// Build-time version info, injected via RUSTFLAGS or env.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("mcstat {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.merge(cli.overrides());

    // Metrics go to stdout; logs stay on stderr.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting mcstat",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(mut cfg: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let signals = shutdown.listen_for_signals()?;

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);

    if let Some(query) = cfg.sinks.clickhouse.channels_query.clone() {
        cfg.validate_clickhouse().context("validating config")?;
        let channels = sink::clickhouse::load_channels(&cfg.sinks.clickhouse, &query, &health)
            .await
            .context("loading channels from ClickHouse")?;
        cfg.extend_channels(channels);
    }

    let duplicates = cfg.dedup_channels();
    if duplicates > 0 {
        tracing::warn!(duplicates, "ignoring repeated channels");
    }

    cfg.validate().context("validating config")?;

    let sockets = net::open_channel_sockets(&cfg.channels, cfg.interface)
        .context("opening channel sockets")?;

    tracing::info!(
        channels = sockets.len(),
        interface = %cfg.interface,
        sinks = ?cfg.enabled_sinks(),
        "joined multicast groups"
    );

    let mut pipeline = Pipeline::new(
        cfg.interval,
        cfg.queue_capacity,
        Arc::clone(&health),
        shutdown.clone(),
    );

    if cfg.sinks.console.enabled {
        pipeline.add_sink(ConsoleSink::stdout()).await?;
    }
    if cfg.sinks.clickhouse.enabled {
        let sink = ClickHouseSink::new(cfg.sinks.clickhouse.clone(), Arc::clone(&health));
        pipeline.add_sink(sink).await?;
    }

    if cfg.health.enabled {
        health.start().await.context("starting health server")?;
    }

    let report = pipeline.run(sockets).await?;

    health.stop();
    shutdown.trigger();
    let _ = signals.await;

    let failed: Vec<_> = report
        .sinks
        .iter()
        .filter(|(_, exit)| *exit == SinkExit::Failed)
        .map(|(name, _)| *name)
        .collect();

    tracing::info!(datagrams = report.receiver.datagrams, "mcstat stopped");

    if !failed.is_empty() {
        bail!("sinks failed during run: {}", failed.join(", "));
    }

    Ok(())
}
