use std::time::{Duration, SystemTime};

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::domain::Event;

use super::queue::{EventSender, QueueError};

/// Enqueues `Tick(now)` every `interval`, first one `interval` after start.
///
/// Holds no resources, so it is simply aborted at shutdown. Returns on its own
/// only if the queue's consumer is gone.
pub async fn run(interval: Duration, tx: EventSender) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(?interval, "ticker started");

    loop {
        ticker.tick().await;

        match tx.offer(Event::Tick(SystemTime::now())) {
            Ok(()) | Err(QueueError::CapacityExceeded { .. }) => {}
            Err(QueueError::Closed { .. }) => {
                debug!("ticker queue closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::health::HealthMetrics;
    use crate::pipeline::queue;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, mut rx) = queue::channel("events", 8, health);
        let start = Instant::now();

        let task = tokio::spawn(run(Duration::from_secs(5), tx));

        for n in 1..=3u32 {
            assert!(matches!(rx.recv().await, Some(Event::Tick(_))));
            assert_eq!(start.elapsed(), Duration::from_secs(5) * n);
        }

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_consumer_gone() {
        let health = Arc::new(HealthMetrics::new("").expect("metrics"));
        let (tx, rx) = queue::channel("events", 8, health);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(10), run(Duration::from_secs(1), tx))
            .await
            .expect("ticker should return");
    }
}
