use std::time::{Duration, SystemTime};

use crate::domain::{Aggr, Channel, Metric};

/// Converts one window's counters into rates.
///
/// `interval` is the configured window length and must be non-zero; the
/// caller guarantees it.
pub fn compute(timestamp: SystemTime, interval: Duration, channel: Channel, aggr: Aggr) -> Metric {
    let seconds = interval.as_secs_f64();
    Metric {
        timestamp,
        channel,
        bitrate: (aggr.bytes as f64) * 8.0 / 1024.0 / seconds,
        packets: (aggr.packets as f64) / seconds,
    }
}
