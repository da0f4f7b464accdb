use std::time::{SystemTime, UNIX_EPOCH};

use super::{Aggr, Channel};

/// Event passed between pipeline tasks.
///
/// Every queue has exactly one consumer. `Term` is always the last event a
/// producer puts on a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// End of stream. Nothing follows from the same producer.
    Term(SystemTime),
    /// Window boundary. Carries no data.
    Tick(SystemTime),
    /// One observation for a channel.
    Sample {
        timestamp: SystemTime,
        channel: Channel,
        delta: Aggr,
    },
    /// Computed rate for one channel and window. Aggregator to sink only.
    Metric(Metric),
}

impl Event {
    /// Zero-delta marker announcing that a channel exists.
    pub fn seen(timestamp: SystemTime, channel: Channel) -> Self {
        Self::Sample {
            timestamp,
            channel,
            delta: Aggr::empty(),
        }
    }

    /// One received datagram of `bytes` length.
    pub fn datagram(timestamp: SystemTime, channel: Channel, bytes: usize) -> Self {
        Self::Sample {
            timestamp,
            channel,
            delta: Aggr::datagram(bytes),
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        match self {
            Self::Term(ts) | Self::Tick(ts) => *ts,
            Self::Sample { timestamp, .. } => *timestamp,
            Self::Metric(m) => m.timestamp,
        }
    }

    pub fn is_term(&self) -> bool {
        matches!(self, Self::Term(_))
    }

    /// Short label used in logs and drop counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Term(_) => "term",
            Self::Tick(_) => "tick",
            Self::Sample { .. } => "sample",
            Self::Metric(_) => "metric",
        }
    }
}

/// Bitrate and packet rate of one channel over one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    pub timestamp: SystemTime,
    pub channel: Channel,
    /// kbit/s.
    pub bitrate: f64,
    /// packets/s.
    pub packets: f64,
}

impl Metric {
    /// Timestamp as fractional seconds since the Unix epoch.
    pub fn unix_seconds(&self) -> f64 {
        unix_seconds(self.timestamp)
    }
}

/// Converts a wall-clock time to fractional seconds since the Unix epoch.
///
/// Times before the epoch map to 0.
pub fn unix_seconds(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
