pub mod clickhouse;
pub mod console;

use std::future::Future;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{Event, Metric};
use crate::health::HealthMetrics;

pub use self::clickhouse::ClickHouseSink;
pub use self::console::ConsoleSink;

/// Most metrics a sink drains from its queue before writing them out.
pub const MAX_BATCH: usize = 512;

/// Write failure of a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("writing to output: {0}")]
    Io(#[from] io::Error),

    #[error("clickhouse: {0}")]
    ClickHouse(#[from] clickhouse_rs::errors::Error),
}

impl SinkError {
    /// Whether reconnecting might make the same write succeed.
    pub fn is_transient(&self) -> bool {
        use clickhouse_rs::errors::Error;

        match self {
            Self::Io(_) => false,
            Self::ClickHouse(e) => {
                matches!(e, Error::Io(_) | Error::Connection(_) | Error::Driver(_))
            }
        }
    }

    /// Short label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::ClickHouse(_) if self.is_transient() => "connection",
            Self::ClickHouse(_) => "server",
        }
    }
}

/// Sink consumes computed metrics and persists or prints them.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &'static str;

    /// Acquire resources. Failing here is a startup error.
    fn start(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Write one batch of metrics, in order.
    fn write(&mut self, metrics: &[Metric]) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Release resources.
    fn stop(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// How a sink task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkExit {
    /// Saw `Term` and released its resources.
    Terminated,
    /// The queue closed without `Term`.
    Disconnected,
    /// A write failed for good; the sink gave up.
    Failed,
}

/// Consumes `rx` until `Term`, writing every metric to `sink`.
///
/// Metrics already queued are drained and written together. A write error
/// stops only this sink; the other sinks keep their own queues.
pub async fn run<S: Sink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Event>,
    health: Arc<HealthMetrics>,
) -> SinkExit {
    let name = sink.name();
    info!(sink = name, "sink started");

    let mut batch = Vec::with_capacity(MAX_BATCH);

    let exit = loop {
        let Some(event) = rx.recv().await else {
            warn!(sink = name, "sink queue closed without term");
            break SinkExit::Disconnected;
        };

        let mut term = collect(event, &mut batch, name);
        while term.is_none() && batch.len() < MAX_BATCH {
            let Ok(event) = rx.try_recv() else {
                break;
            };
            term = collect(event, &mut batch, name);
        }

        if !batch.is_empty() {
            match sink.write(&batch).await {
                Ok(()) => {
                    health
                        .sink_writes
                        .with_label_values(&[name])
                        .inc_by(batch.len() as u64);
                    debug!(sink = name, rows = batch.len(), "metrics written");
                }
                Err(e) => {
                    health
                        .sink_errors
                        .with_label_values(&[name, e.kind()])
                        .inc();
                    error!(sink = name, error = %e, lost = batch.len(), "sink write failed, stopping sink");
                    break SinkExit::Failed;
                }
            }
            batch.clear();
        }

        if term.is_some() {
            break SinkExit::Terminated;
        }
    };

    if let Err(e) = sink.stop().await {
        warn!(sink = name, error = %e, "error stopping sink");
    }

    info!(sink = name, exit = ?exit, "sink stopped");

    exit
}

/// Adds a metric to `batch`; returns the term timestamp if `event` ends the
/// stream.
fn collect(event: Event, batch: &mut Vec<Metric>, name: &str) -> Option<std::time::SystemTime> {
    match event {
        Event::Metric(m) => {
            batch.push(m);
            None
        }
        Event::Term(ts) => Some(ts),
        other => {
            warn!(sink = name, kind = other.kind(), "unexpected event on sink input, ignoring");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// In-memory sink recording every write, optionally failing on demand.
    #[derive(Default, Clone)]
    pub struct RecordingSink {
        pub written: Arc<Mutex<Vec<Metric>>>,
        pub batches: Arc<Mutex<usize>>,
        pub stopped: Arc<Mutex<bool>>,
        pub fail_after: Option<usize>,
    }

    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn write(&mut self, metrics: &[Metric]) -> Result<(), SinkError> {
            let mut written = self.written.lock();
            if let Some(limit) = self.fail_after {
                if written.len() >= limit {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed").into());
                }
            }
            written.extend_from_slice(metrics);
            *self.batches.lock() += 1;
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            *self.stopped.lock() = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    use super::testing::RecordingSink;
    use super::*;
    use crate::domain::{Aggr, Channel};
    use crate::pipeline::{metric, queue};

    fn metric_at(secs: u64, last: u8) -> Metric {
        metric::compute(
            SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            Duration::from_secs(1),
            Channel::new(Ipv4Addr::new(239, 0, 0, last), 5000),
            Aggr {
                packets: 1,
                bytes: 128,
            },
        )
    }

    #[tokio::test]
    async fn test_writes_until_term() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, rx) = queue::channel("sink:recording", 16, Arc::clone(&health));
        let sink = RecordingSink::default();

        for n in 1..=3 {
            tx.offer(Event::Metric(metric_at(n, 1))).expect("enqueue");
        }
        tx.send(Event::Term(SystemTime::UNIX_EPOCH))
            .await
            .expect("enqueue term");
        // Never written: the sink stops at term.
        let _ = tx.offer(Event::Metric(metric_at(9, 1)));

        let exit = run(sink.clone(), rx, Arc::clone(&health)).await;

        assert_eq!(exit, SinkExit::Terminated);
        let written = sink.written.lock();
        assert_eq!(written.len(), 3);
        assert_eq!(written[2], metric_at(3, 1));
        assert!(*sink.stopped.lock());
        assert_eq!(health.sink_writes.with_label_values(&["recording"]).get(), 3);
    }

    #[tokio::test]
    async fn test_queued_metrics_written_as_one_batch() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, rx) = queue::channel("sink:recording", 16, Arc::clone(&health));
        let sink = RecordingSink::default();

        for last in 1..=4 {
            tx.offer(Event::Metric(metric_at(1, last))).expect("enqueue");
        }
        tx.offer(Event::Term(SystemTime::UNIX_EPOCH)).expect("enqueue");

        run(sink.clone(), rx, health).await;

        assert_eq!(*sink.batches.lock(), 1);
        assert_eq!(sink.written.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_write_stops_sink() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, rx) = queue::channel("sink:recording", 16, Arc::clone(&health));
        let sink = RecordingSink {
            fail_after: Some(0),
            ..Default::default()
        };

        tx.offer(Event::Metric(metric_at(1, 1))).expect("enqueue");
        let task = tokio::spawn(run(sink.clone(), rx, Arc::clone(&health)));

        assert_eq!(task.await.expect("sink task"), SinkExit::Failed);
        assert!(*sink.stopped.lock());
        assert_eq!(
            health.sink_errors.with_label_values(&["recording", "io"]).get(),
            1
        );
        // The queue is gone with the sink; producers see it closed.
        assert!(tx.offer(Event::Metric(metric_at(2, 1))).is_err());
    }

    #[tokio::test]
    async fn test_non_metric_events_are_ignored() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, rx) = queue::channel("sink:recording", 16, Arc::clone(&health));
        let sink = RecordingSink::default();

        tx.offer(Event::Tick(SystemTime::UNIX_EPOCH)).expect("enqueue");
        tx.offer(Event::Metric(metric_at(1, 1))).expect("enqueue");
        tx.offer(Event::Term(SystemTime::UNIX_EPOCH)).expect("enqueue");

        assert_eq!(run(sink.clone(), rx, health).await, SinkExit::Terminated);
        assert_eq!(sink.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_without_term() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, rx) = queue::channel("sink:recording", 4, Arc::clone(&health));
        drop(tx);

        let sink = RecordingSink::default();
        assert_eq!(run(sink.clone(), rx, health).await, SinkExit::Disconnected);
        assert!(*sink.stopped.lock());
    }

    #[test]
    fn test_error_kind() {
        let e = SinkError::from(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        assert!(!e.is_transient());
        assert_eq!(e.kind(), "io");
    }
}
