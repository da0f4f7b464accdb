use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{Aggr, Channel, Event, Metric};
use crate::health::HealthMetrics;

use super::metric;
use super::queue::EventSender;

/// Insertion-ordered channel → counters map.
///
/// Entries are created on first touch and never removed; a tick resets them in
/// place so idle channels keep reporting.
#[derive(Debug, Default)]
pub struct ChannelTable {
    index: HashMap<Channel, usize>,
    entries: Vec<(Channel, Aggr)>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters for `channel`, inserting empty ones first if absent.
    pub fn get_or_insert(&mut self, channel: Channel) -> &mut Aggr {
        let idx = *self.index.entry(channel).or_insert_with(|| {
            self.entries.push((channel, Aggr::empty()));
            self.entries.len() - 1
        });
        &mut self.entries[idx].1
    }

    pub fn get(&self, channel: &Channel) -> Option<&Aggr> {
        self.index.get(channel).map(|&idx| &self.entries[idx].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visits every entry in insertion order, handing out the window's counters
    /// and leaving the entry reset.
    pub fn drain_window(&mut self, mut f: impl FnMut(Channel, Aggr)) {
        for (channel, aggr) in &mut self.entries {
            f(*channel, aggr.take());
        }
    }
}

/// Result of applying one event to the aggregator state.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// Nothing to forward.
    Continue,
    /// A tick closed the window; forward these metrics.
    Emit(Vec<Metric>),
    /// End of stream; forward the term and stop.
    Terminate(SystemTime),
}

/// Accumulates per-channel counters and turns them into metrics on each tick.
///
/// The counters are owned here and nowhere else; other tasks only ever see
/// immutable events.
pub struct Aggregator {
    interval: Duration,
    table: ChannelTable,
}

impl Aggregator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            table: ChannelTable::new(),
        }
    }

    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    /// Applies one event. Only `Term` ends the stream.
    ///
    /// Rates are divided by the configured interval, not by the time actually
    /// elapsed between the ticks this aggregator processed.
    pub fn apply(&mut self, event: Event) -> Step {
        match event {
            Event::Sample { channel, delta, .. } => {
                *self.table.get_or_insert(channel) += delta;
                Step::Continue
            }
            Event::Tick(ts) => {
                let interval = self.interval;
                let mut metrics = Vec::with_capacity(self.table.len());
                self.table.drain_window(|channel, aggr| {
                    metrics.push(metric::compute(ts, interval, channel, aggr));
                });
                Step::Emit(metrics)
            }
            Event::Term(ts) => Step::Terminate(ts),
            Event::Metric(m) => {
                warn!(channel = %m.channel, "unexpected metric event on aggregator input, ignoring");
                Step::Continue
            }
        }
    }

    /// Consumes `rx` until `Term`, fanning metrics and the final term out to
    /// every output queue.
    ///
    /// If every producer goes away without sending `Term`, a term stamped with
    /// the current time is forwarded instead so sinks still shut down.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<Event>,
        outputs: Vec<EventSender>,
        health: Arc<HealthMetrics>,
    ) {
        info!(interval = ?self.interval, outputs = outputs.len(), "aggregator started");

        let term_ts = loop {
            let Some(event) = rx.recv().await else {
                warn!("aggregator input closed without term");
                break SystemTime::now();
            };

            match self.apply(event) {
                Step::Continue => {}
                Step::Emit(metrics) => {
                    health.ticks_processed.inc();
                    health.metrics_emitted.inc_by(metrics.len() as u64);
                    debug!(channels = metrics.len(), "window closed");

                    for m in metrics {
                        for out in &outputs {
                            // Full sink queues are counted by the sender.
                            if let Err(e) = out.offer(Event::Metric(m)) {
                                debug!(error = %e, "metric not delivered");
                            }
                        }
                    }
                }
                Step::Terminate(ts) => break ts,
            }
        };

        for out in &outputs {
            if let Err(e) = out.send(Event::Term(term_ts)).await {
                debug!(error = %e, "term not delivered");
            }
        }

        info!(channels = self.table.len(), "aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::pipeline::queue;

    fn ch(last: u8) -> Channel {
        Channel::new(Ipv4Addr::new(239, 0, 0, last), 5000)
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn emitted(step: Step) -> Vec<Metric> {
        match step {
            Step::Emit(metrics) => metrics,
            other => panic!("expected emit, got {other:?}"),
        }
    }

    #[test]
    fn test_channel_table_keeps_insertion_order() {
        let mut table = ChannelTable::new();
        *table.get_or_insert(ch(3)) += Aggr::datagram(1);
        *table.get_or_insert(ch(1)) += Aggr::datagram(2);
        *table.get_or_insert(ch(3)) += Aggr::datagram(3);

        let mut seen = Vec::new();
        table.drain_window(|channel, aggr| seen.push((channel, aggr)));
        assert_eq!(
            seen,
            vec![
                (
                    ch(3),
                    Aggr {
                        packets: 2,
                        bytes: 4
                    }
                ),
                (
                    ch(1),
                    Aggr {
                        packets: 1,
                        bytes: 2
                    }
                ),
            ]
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&ch(3)), Some(&Aggr::empty()));
    }

    #[test]
    fn test_window_sums_samples_per_channel() {
        let mut agg = Aggregator::new(Duration::from_secs(2));
        agg.apply(Event::seen(at(0), ch(1)));
        agg.apply(Event::seen(at(0), ch(2)));
        for n in [100, 200, 300] {
            agg.apply(Event::datagram(at(1), ch(1), n));
        }
        agg.apply(Event::datagram(at(1), ch(2), 1024));

        let metrics = emitted(agg.apply(Event::Tick(at(2))));
        assert_eq!(metrics.len(), 2);

        assert_eq!(metrics[0].channel, ch(1));
        assert_eq!(metrics[0].packets, 1.5);
        assert_eq!(metrics[0].bitrate, 600.0 * 8.0 / 1024.0 / 2.0);
        assert_eq!(metrics[0].timestamp, at(2));

        assert_eq!(metrics[1].channel, ch(2));
        assert_eq!(metrics[1].packets, 0.5);
        assert_eq!(metrics[1].bitrate, 4.0);
    }

    #[test]
    fn test_idle_channel_reports_zero() {
        let mut agg = Aggregator::new(Duration::from_secs(1));
        agg.apply(Event::seen(at(0), ch(1)));

        let metrics = emitted(agg.apply(Event::Tick(at(1))));
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].bitrate, 0.0);
        assert_eq!(metrics[0].packets, 0.0);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut agg = Aggregator::new(Duration::from_secs(1));
        agg.apply(Event::datagram(at(0), ch(1), 500));
        agg.apply(Event::datagram(at(0), ch(2), 500));

        let first = emitted(agg.apply(Event::Tick(at(1))));
        assert!(first.iter().all(|m| m.packets == 1.0));

        for secs in [2, 3] {
            let metrics = emitted(agg.apply(Event::Tick(at(secs))));
            assert_eq!(metrics.len(), 2);
            assert!(metrics.iter().all(|m| m.packets == 0.0 && m.bitrate == 0.0));
        }
    }

    #[test]
    fn test_tick_without_channels_emits_nothing() {
        let mut agg = Aggregator::new(Duration::from_secs(1));
        assert_eq!(agg.apply(Event::Tick(at(1))), Step::Emit(Vec::new()));
    }

    #[test]
    fn test_stray_metric_does_not_stop() {
        let mut agg = Aggregator::new(Duration::from_secs(1));
        let stray = metric::compute(at(0), Duration::from_secs(1), ch(1), Aggr::empty());
        assert_eq!(agg.apply(Event::Metric(stray)), Step::Continue);
        assert!(agg.table().is_empty());
        assert_eq!(agg.apply(Event::Term(at(9))), Step::Terminate(at(9)));
    }

    #[tokio::test]
    async fn test_run_fans_out_and_terminates_once() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (in_tx, in_rx) = queue::channel("events", 16, Arc::clone(&health));
        let (a_tx, mut a_rx) = queue::channel("sink:a", 16, Arc::clone(&health));
        let (b_tx, mut b_rx) = queue::channel("sink:b", 16, Arc::clone(&health));

        let task = tokio::spawn(Aggregator::new(Duration::from_secs(1)).run(
            in_rx,
            vec![a_tx, b_tx],
            Arc::clone(&health),
        ));

        in_tx.offer(Event::seen(at(0), ch(1))).expect("enqueue");
        in_tx.offer(Event::datagram(at(0), ch(1), 128)).expect("enqueue");
        in_tx.offer(Event::Tick(at(1))).expect("enqueue");
        in_tx.send(Event::Term(at(2))).await.expect("enqueue term");
        // Anything after term is never forwarded.
        let _ = in_tx.offer(Event::Tick(at(3)));

        task.await.expect("aggregator task");

        for rx in [&mut a_rx, &mut b_rx] {
            let Some(Event::Metric(m)) = rx.recv().await else {
                panic!("expected metric");
            };
            assert_eq!(m.packets, 1.0);
            assert_eq!(m.bitrate, 1.0);
            assert_eq!(rx.recv().await, Some(Event::Term(at(2))));
            assert_eq!(rx.recv().await, None);
        }

        assert_eq!(health.ticks_processed.get(), 1);
        assert_eq!(health.metrics_emitted.get(), 1);
    }

    #[tokio::test]
    async fn test_run_forwards_term_when_input_closes() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (in_tx, in_rx) = queue::channel("events", 4, Arc::clone(&health));
        let (out_tx, mut out_rx) = queue::channel("sink:a", 4, Arc::clone(&health));

        drop(in_tx);
        Aggregator::new(Duration::from_secs(1))
            .run(in_rx, vec![out_tx], health)
            .await;

        assert!(matches!(out_rx.recv().await, Some(Event::Term(_))));
        assert_eq!(out_rx.recv().await, None);
    }
}
