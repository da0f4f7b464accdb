use std::future::poll_fn;
use std::io;
use std::sync::Arc;
use std::task::Poll;
use std::time::SystemTime;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::domain::{Channel, Event};
use crate::health::HealthMetrics;
use crate::shutdown::ShutdownSignal;

use super::queue::{EventSender, QueueError};

/// Large enough for any UDP datagram, so reported sizes are never truncated.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// A socket read failed with something other than "would block". The channel
/// is dropped for the rest of the run.
#[derive(Error, Debug)]
#[error("reading from {channel}: {source}")]
pub struct ChannelReadError {
    pub channel: Channel,
    #[source]
    pub source: io::Error,
}

struct ChannelSocket {
    channel: Channel,
    socket: UdpSocket,
}

/// Summary returned when the receiver stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Datagrams read across all channels.
    pub datagrams: u64,
    /// Channels dropped after read errors, in the order they failed.
    pub dropped: Vec<Channel>,
    /// Sockets closed at shutdown.
    pub closed: usize,
}

/// Reads datagrams from every channel socket and turns them into samples.
///
/// Waits on all sockets and the shutdown signal at once. Owns the sockets for
/// their whole lifetime and closes them before emitting the final `Term`.
pub struct Receiver {
    sockets: Vec<ChannelSocket>,
    tx: EventSender,
    shutdown: ShutdownSignal,
    health: Arc<HealthMetrics>,
}

impl Receiver {
    /// Registers already-opened sockets with the runtime's readiness
    /// multiplexer. Must be called from within a tokio runtime.
    pub fn new(
        sockets: Vec<(Channel, std::net::UdpSocket)>,
        tx: EventSender,
        shutdown: ShutdownSignal,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let sockets = sockets
            .into_iter()
            .map(|(channel, socket)| {
                socket
                    .set_nonblocking(true)
                    .with_context(|| format!("setting {channel} non-blocking"))?;
                let socket = UdpSocket::from_std(socket)
                    .with_context(|| format!("registering {channel} socket"))?;
                Ok(ChannelSocket { channel, socket })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sockets,
            tx,
            shutdown,
            health,
        })
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.sockets.iter().map(|s| s.channel)
    }

    /// Serves all channels until shutdown is requested, then closes every
    /// socket and enqueues `Term` exactly once.
    pub async fn run(self) -> ReceiverReport {
        let Self {
            mut sockets,
            tx,
            shutdown,
            health,
        } = self;

        let mut report = ReceiverReport::default();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut ready: Vec<usize> = Vec::with_capacity(sockets.len());
        let mut failed: Vec<usize> = Vec::new();

        // Announcements wait for room: a channel missing here would be absent
        // from every report until its first datagram.
        let now = SystemTime::now();
        for s in &sockets {
            if let Err(e) = tx.send(Event::seen(now, s.channel)).await {
                debug!(error = %e, "announcement not delivered");
            }
        }
        health.channels_active.set(sockets.len() as i64);

        info!(channels = sockets.len(), "receiver started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => {
                    debug!("receiver observed shutdown");
                    break;
                }
                _ = wait_readable(&sockets, &mut ready) => {}
            }

            let now = SystemTime::now();
            for &idx in &ready {
                let s = &sockets[idx];
                match s.socket.try_recv(&mut buf) {
                    Ok(n) => {
                        trace!(channel = %s.channel, bytes = n, "datagram");
                        enqueue(&tx, Event::datagram(now, s.channel, n));
                        report.datagrams += 1;
                        health.packets_received.inc();
                        health.bytes_received.inc_by(n as u64);
                    }
                    // Readiness can be spurious.
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(source) => {
                        let err = ChannelReadError {
                            channel: s.channel,
                            source,
                        };
                        warn!(error = %err, "dropping channel");
                        health.channel_read_errors.inc();
                        failed.push(idx);
                    }
                }
            }

            if !failed.is_empty() {
                // `ready` is ascending, so removing from the back keeps indices valid.
                for idx in failed.drain(..).rev() {
                    let dropped = sockets.remove(idx);
                    report.dropped.push(dropped.channel);
                }
                health.channels_active.set(sockets.len() as i64);

                if sockets.is_empty() {
                    warn!("no channels left, waiting for shutdown");
                }
            }
        }

        report.closed = sockets.len();
        drop(sockets);
        health.channels_active.set(0);
        info!(
            closed = report.closed,
            dropped = report.dropped.len(),
            datagrams = report.datagrams,
            "receiver sockets closed",
        );

        if let Err(e) = tx.send(Event::Term(SystemTime::now())).await {
            warn!(error = %e, "could not deliver term");
        }

        report
    }
}

/// Non-blocking enqueue; full queues are counted by the sender.
fn enqueue(tx: &EventSender, event: Event) {
    match tx.offer(event) {
        Ok(()) | Err(QueueError::CapacityExceeded { .. }) => {}
        Err(e @ QueueError::Closed { .. }) => debug!(error = %e, "sample not delivered"),
    }
}

/// Waits until at least one socket is readable, collecting the indices of all
/// readable sockets into `ready`. Never completes for an empty slice.
async fn wait_readable(sockets: &[ChannelSocket], ready: &mut Vec<usize>) {
    poll_fn(|cx| {
        ready.clear();
        for (idx, s) in sockets.iter().enumerate() {
            // Errors are surfaced by the following read.
            if s.socket.poll_recv_ready(cx).is_ready() {
                ready.push(idx);
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    })
    .await
}
