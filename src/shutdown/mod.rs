use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Turns SIGINT/SIGTERM into a waitable shutdown notification.
///
/// Once triggered the signal stays set, so any number of waiters observe it.
/// Installing the listener replaces the default signal disposition: the
/// process no longer dies from the signal directly and shutdown is observed
/// only through [`ShutdownSignal::requested`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await;
    }

    /// Installs SIGINT and SIGTERM handlers and spawns a task that triggers
    /// this signal when either arrives.
    ///
    /// Handlers are registered before this returns, so a signal delivered
    /// afterwards is never lost.
    pub fn listen_for_signals(&self) -> Result<JoinHandle<()>> {
        let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
        let token = self.token.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                }
            }

            token.cancel();
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let shutdown = ShutdownSignal::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.requested().await })
        };

        assert!(!shutdown.is_requested());
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .expect("waiter task");
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_requested_is_level_triggered() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        shutdown.trigger();

        // Every later wait completes immediately.
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(100), shutdown.requested())
                .await
                .expect("already requested");
        }
    }

    #[tokio::test]
    async fn test_listener_exits_when_triggered_programmatically() {
        let shutdown = ShutdownSignal::new();
        let handle = shutdown.listen_for_signals().expect("install handlers");

        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should exit")
            .expect("listener task");
    }
}
