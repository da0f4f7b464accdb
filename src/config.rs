use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::domain::Channel;
use crate::pipeline::queue::DEFAULT_CAPACITY;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Length of one measurement window. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Capacity of every pipeline queue. Default: 1000.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Local interface address used for group membership. Default: 0.0.0.0.
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Channels to monitor, as `ip:port`.
    #[serde(default)]
    pub channels: Vec<Channel>,

    /// Output sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Output sink configuration.
#[derive(Debug, Default, Deserialize)]
pub struct SinksConfig {
    /// Tab-separated lines on standard output.
    #[serde(default)]
    pub console: ConsoleConfig,

    /// ClickHouse database sink.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// Console sink configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConsoleConfig {
    /// Enable the console sink. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "multicast_metrics".
    #[serde(default = "default_table")]
    pub table: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Create the table on startup if it does not exist. Default: false.
    #[serde(default)]
    pub create_table: bool,

    /// Query returning extra `(address, port)` channels to monitor, run once
    /// at startup.
    #[serde(default)]
    pub channels_query: Option<String>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "multicast_metrics".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            queue_capacity: default_queue_capacity(),
            interface: default_interface(),
            channels: Vec::new(),
            sinks: SinksConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            create_table: false,
            channels_query: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

/// Command-line values that take precedence over the configuration file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub interval: Option<Duration>,
    pub channels: Vec<Channel>,
    pub console: bool,
    pub clickhouse: bool,
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file without validating it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::parse(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text.
    pub fn parse(data: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Applies command-line overrides. Channels given on the command line are
    /// appended to the configured ones.
    pub fn merge(&mut self, overrides: Overrides) {
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(interval) = overrides.interval {
            self.interval = interval;
        }
        if overrides.console {
            self.sinks.console.enabled = true;
        }
        if overrides.clickhouse {
            self.sinks.clickhouse.enabled = true;
        }
        self.channels.extend(overrides.channels);
    }

    /// Adds channels discovered at runtime (e.g. from the database).
    pub fn extend_channels(&mut self, channels: impl IntoIterator<Item = Channel>) {
        self.channels.extend(channels);
    }

    /// Removes repeated channels, keeping the first occurrence. Returns how
    /// many were removed.
    pub fn dedup_channels(&mut self) -> usize {
        let before = self.channels.len();
        let mut seen = std::collections::HashSet::with_capacity(before);
        self.channels.retain(|ch| seen.insert(*ch));
        before - self.channels.len()
    }

    /// Names of the enabled sinks, in pipeline order.
    pub fn enabled_sinks(&self) -> Vec<&'static str> {
        let mut sinks = Vec::with_capacity(2);
        if self.sinks.console.enabled {
            sinks.push("console");
        }
        if self.sinks.clickhouse.enabled {
            sinks.push("clickhouse");
        }
        sinks
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }

        if self.channels.is_empty() {
            bail!("at least one channel (ip:port) is required");
        }

        if let Some(ch) = self
            .channels
            .iter()
            .find(|ch| !crate::net::is_multicast(ch.address))
        {
            bail!("invalid multicast address: {}", ch.address);
        }

        if self.enabled_sinks().is_empty() {
            bail!("no sink enabled (use -s for console or -d for database)");
        }

        // Each tick puts one metric per channel plus Term into every sink
        // queue at once.
        if self.channels.len() >= self.queue_capacity {
            bail!(
                "queue_capacity ({}) must exceed the number of channels ({})",
                self.queue_capacity,
                self.channels.len()
            );
        }

        self.validate_clickhouse()
    }

    /// Checks the ClickHouse section. Runs on its own before the channels
    /// query, which needs a usable endpoint.
    pub fn validate_clickhouse(&self) -> Result<()> {
        let ch = &self.sinks.clickhouse;
        if !ch.enabled && ch.channels_query.is_none() {
            return Ok(());
        }

        if ch.endpoint.is_empty() {
            bail!("sinks.clickhouse.endpoint is required");
        }
        if ch.database.is_empty() {
            bail!("sinks.clickhouse.database is required");
        }
        if ch.table.is_empty() {
            bail!("sinks.clickhouse.table is required");
        }
        if !is_identifier(&ch.database) || !is_identifier(&ch.table) {
            bail!(
                "sinks.clickhouse database/table must be plain identifiers, got {}.{}",
                ch.database,
                ch.table
            );
        }

        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
