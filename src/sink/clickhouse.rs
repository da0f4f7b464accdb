use std::fmt::Write;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use tracing::{info, warn};

use crate::config::ClickHouseConfig;
use crate::domain::{Channel, Metric};
use crate::health::HealthMetrics;

use super::{Sink, SinkError};

/// Writes metrics into a ClickHouse table over the native TCP protocol.
///
/// A write that fails with a connection-level error is retried once on a
/// fresh pool before the error is surfaced.
pub struct ClickHouseSink {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
    health: Arc<HealthMetrics>,
}

impl ClickHouseSink {
    pub fn new(cfg: ClickHouseConfig, health: Arc<HealthMetrics>) -> Self {
        Self {
            cfg,
            pool: None,
            health,
        }
    }

    /// Fully qualified `database.table`.
    fn table(&self) -> String {
        format!("{}.{}", self.cfg.database, self.cfg.table)
    }

    /// Opens a new pool and verifies connectivity with a ping.
    async fn connect(&mut self) -> Result<Pool, SinkError> {
        let pool = Pool::new(build_dsn(&self.cfg));
        let mut handle = pool.get_handle().await?;
        handle.ping().await?;

        self.pool = Some(pool.clone());
        Ok(pool)
    }

    async fn execute(&mut self, sql: &str) -> Result<(), SinkError> {
        let pool = match &self.pool {
            Some(pool) => pool.clone(),
            None => self.connect().await?,
        };

        let mut handle = pool.get_handle().await?;
        handle.execute(sql).await?;
        Ok(())
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             timestamp DateTime64(3), \
             address String, \
             port UInt16, \
             bitrate Float64, \
             packets Float64\
             ) ENGINE = MergeTree ORDER BY (address, port, timestamp)",
            self.table()
        )
    }

    fn insert_sql(&self, metrics: &[Metric]) -> String {
        let mut sql = String::with_capacity(96 + metrics.len() * 80);
        let _ = write!(
            sql,
            "INSERT INTO {} (timestamp, address, port, bitrate, packets) VALUES ",
            self.table()
        );

        for (idx, m) in metrics.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(
                sql,
                "({}, '{}', {}, {}, {})",
                format_datetime(m.timestamp),
                m.channel.address,
                m.channel.port,
                m.bitrate,
                m.packets
            );
        }

        sql
    }
}

impl Sink for ClickHouseSink {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn start(&mut self) -> Result<()> {
        self.connect()
            .await
            .with_context(|| format!("connecting to ClickHouse at {}", self.cfg.endpoint))?;

        if self.cfg.create_table {
            let sql = self.create_table_sql();
            self.execute(&sql)
                .await
                .with_context(|| format!("creating table {}", self.table()))?;
        }

        info!(endpoint = %self.cfg.endpoint, table = %self.table(), "ClickHouse sink connected");

        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> Result<(), SinkError> {
        let sql = self.insert_sql(metrics);

        match self.execute(&sql).await {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "ClickHouse write failed, reconnecting");
                self.health
                    .sink_reconnects
                    .with_label_values(&["clickhouse"])
                    .inc();

                self.pool = None;
                self.connect().await?;
                self.execute(&sql).await
            }
            other => other,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.pool.take();
        Ok(())
    }
}

/// Runs `query` and returns the `(address, port)` rows as channels.
///
/// The first column must be a String address, the second a UInt16 port. A
/// connection-level failure is retried once on a fresh pool, like writes.
pub async fn load_channels(
    cfg: &ClickHouseConfig,
    query: &str,
    health: &HealthMetrics,
) -> Result<Vec<Channel>> {
    let rows = match fetch_channel_rows(cfg, query).await {
        Err(e) if e.is_transient() => {
            warn!(error = %e, "channels query failed, reconnecting");
            health
                .sink_reconnects
                .with_label_values(&["clickhouse"])
                .inc();
            fetch_channel_rows(cfg, query).await
        }
        other => other,
    }
    .with_context(|| format!("running channels query against {}", cfg.endpoint))?;

    let channels = rows
        .into_iter()
        .map(|(address, port)| {
            format!("{address}:{port}")
                .parse::<Channel>()
                .context("channels query returned an invalid channel")
        })
        .collect::<Result<Vec<_>>>()?;

    info!(count = channels.len(), "loaded channels from ClickHouse");

    Ok(channels)
}

async fn fetch_channel_rows(
    cfg: &ClickHouseConfig,
    query: &str,
) -> Result<Vec<(String, u16)>, SinkError> {
    let pool = Pool::new(build_dsn(cfg));
    let mut handle = pool.get_handle().await?;
    let block = handle.query(query).fetch_all().await?;

    let mut rows = Vec::with_capacity(block.row_count());
    for row in block.rows() {
        let address: String = row.get(0_usize)?;
        let port: u16 = row.get(1_usize)?;
        rows.push((address, port));
    }
    Ok(rows)
}

/// Builds a clickhouse-rs compatible TCP DSN from configuration.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
fn build_dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=1&pool_max=2");

    dsn
}

/// Formats a SystemTime as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}
