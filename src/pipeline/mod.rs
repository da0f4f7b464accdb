pub mod aggregator;
pub mod metric;
pub mod queue;
pub mod receiver;
pub mod ticker;

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::{Channel, Event};
use crate::health::HealthMetrics;
use crate::shutdown::ShutdownSignal;
use crate::sink::{self, Sink, SinkExit};

use self::aggregator::Aggregator;
use self::queue::EventSender;
use self::receiver::{Receiver, ReceiverReport};

/// Name of the queue feeding the aggregator.
pub const EVENTS_QUEUE: &str = "events";

/// Outcome of a completed pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    pub receiver: ReceiverReport,
    pub sinks: Vec<(&'static str, SinkExit)>,
}

struct SinkTask {
    name: &'static str,
    tx: EventSender,
    handle: JoinHandle<SinkExit>,
}

/// Wires Receiver and Ticker into the Aggregator, and the Aggregator into every
/// sink, each on its own task with its own bounded queue.
///
/// ```text
/// Receiver ─┐
///           ├─► events ─► Aggregator ─┬─► sink:console ─► ConsoleSink
/// Ticker ───┘                         └─► sink:clickhouse ─► ClickHouseSink
/// ```
pub struct Pipeline {
    interval: Duration,
    queue_capacity: usize,
    health: Arc<HealthMetrics>,
    shutdown: ShutdownSignal,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<Event>,
    sinks: Vec<SinkTask>,
    ticker: bool,
}

impl Pipeline {
    pub fn new(
        interval: Duration,
        queue_capacity: usize,
        health: Arc<HealthMetrics>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (events_tx, events_rx) =
            queue::channel(EVENTS_QUEUE, queue_capacity, Arc::clone(&health));

        Self {
            interval,
            queue_capacity,
            health,
            shutdown,
            events_tx,
            events_rx,
            sinks: Vec::new(),
            ticker: true,
        }
    }

    /// Disables the internal ticker; ticks must then be sent through
    /// [`Pipeline::events`].
    pub fn manual_ticks(mut self) -> Self {
        self.ticker = false;
        self
    }

    /// A producer handle onto the aggregator's input queue.
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Starts `sink` and spawns its consumer task.
    ///
    /// The sink only receives events once [`Pipeline::run`] is called.
    pub async fn add_sink<S: Sink + 'static>(&mut self, mut sink: S) -> Result<()> {
        let name = sink.name();
        sink.start()
            .await
            .with_context(|| format!("starting {name} sink"))?;

        let (tx, rx) = queue::channel(
            sink_queue_name(name),
            self.queue_capacity,
            Arc::clone(&self.health),
        );
        let handle = tokio::spawn(sink::run(sink, rx, Arc::clone(&self.health)));

        self.sinks.push(SinkTask { name, tx, handle });
        Ok(())
    }

    /// Runs until shutdown is requested and every sink has seen `Term`.
    pub async fn run(self, sockets: Vec<(Channel, UdpSocket)>) -> Result<PipelineReport> {
        if self.sinks.is_empty() {
            bail!("pipeline has no sinks");
        }
        if sockets.len() >= self.queue_capacity {
            bail!(
                "queue capacity {} cannot hold one tick of {} channels plus term",
                self.queue_capacity,
                sockets.len()
            );
        }

        let Self {
            interval,
            health,
            shutdown,
            events_tx,
            events_rx,
            sinks,
            ticker,
            ..
        } = self;

        let receiver = Receiver::new(
            sockets,
            events_tx.clone(),
            shutdown,
            Arc::clone(&health),
        )?;

        let (outputs, sink_handles): (Vec<_>, Vec<_>) = sinks
            .into_iter()
            .map(|s| (s.tx, (s.name, s.handle)))
            .unzip();

        let aggregator = tokio::spawn(Aggregator::new(interval).run(
            events_rx,
            outputs,
            Arc::clone(&health),
        ));

        let ticker = ticker.then(|| tokio::spawn(ticker::run(interval, events_tx.clone())));
        let receiver = tokio::spawn(receiver.run());
        drop(events_tx);

        info!(
            sinks = sink_handles.len(),
            interval = ?interval,
            "pipeline running"
        );

        let receiver = receiver.await.context("receiver task failed")?;

        // The ticker holds no resources; stopping it also lets the aggregator
        // see its input close if the receiver never sent Term.
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        aggregator.await.context("aggregator task failed")?;

        let mut exits = Vec::with_capacity(sink_handles.len());
        for (name, handle) in sink_handles {
            match handle.await {
                Ok(exit) => exits.push((name, exit)),
                Err(e) => {
                    warn!(sink = name, error = %e, "sink task failed");
                    exits.push((name, SinkExit::Failed));
                }
            }
        }

        info!(
            datagrams = receiver.datagrams,
            dropped_channels = receiver.dropped.len(),
            "pipeline stopped"
        );

        Ok(PipelineReport {
            receiver,
            sinks: exits,
        })
    }
}

fn sink_queue_name(sink: &'static str) -> &'static str {
    match sink {
        "console" => "sink:console",
        "clickhouse" => "sink:clickhouse",
        other => other,
    }
}
