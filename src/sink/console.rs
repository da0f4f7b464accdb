use std::io::{self, Write};

use anyhow::Result;

use crate::domain::Metric;

use super::{Sink, SinkError};

/// Prints one tab-separated line per metric:
/// `timestamp\taddress\tport\tbitrate\tpackets`, floats with six decimals.
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
}

impl ConsoleSink {
    /// Console sink writing to standard output.
    pub fn stdout() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }
}

/// Formats a metric as a console line, without the trailing newline.
pub fn format_line(m: &Metric) -> String {
    format!(
        "{:.6}\t{}\t{}\t{:.6}\t{:.6}",
        m.unix_seconds(),
        m.channel.address,
        m.channel.port,
        m.bitrate,
        m.packets
    )
}

impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> Result<(), SinkError> {
        for m in metrics {
            writeln!(self.out, "{}", format_line(m))?;
        }
        self.out.flush()?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
