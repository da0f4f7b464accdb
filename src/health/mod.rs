use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "mcstat";

/// Prometheus counters describing the pipeline itself.
///
/// Counters are cheap atomic handles; components hold an `Arc<HealthMetrics>`
/// and update them from their own task. The HTTP server is optional.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Datagrams read from channel sockets.
    pub packets_received: IntCounter,
    /// Payload bytes read from channel sockets.
    pub bytes_received: IntCounter,
    /// Channels currently polled by the receiver.
    pub channels_active: IntGauge,
    /// Channels dropped after a read error.
    pub channel_read_errors: IntCounter,
    /// Events dropped because a queue was full, by queue.
    pub events_dropped: IntCounterVec,
    /// Ticks handled by the aggregator.
    pub ticks_processed: IntCounter,
    /// Metrics computed by the aggregator.
    pub metrics_emitted: IntCounter,
    /// Metrics written by each sink.
    pub sink_writes: IntCounterVec,
    /// Failed sink writes by sink and error kind.
    pub sink_errors: IntCounterVec,
    /// Sink reconnect attempts.
    pub sink_reconnects: IntCounterVec,
}

impl HealthMetrics {
    /// Creates the metrics and registers them. `addr` is only used by
    /// [`HealthMetrics::start`].
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let packets_received = IntCounter::with_opts(
            Opts::new(
                "packets_received_total",
                "Datagrams read from channel sockets.",
            )
            .namespace(NAMESPACE),
        )?;
        let bytes_received = IntCounter::with_opts(
            Opts::new(
                "bytes_received_total",
                "Payload bytes read from channel sockets.",
            )
            .namespace(NAMESPACE),
        )?;
        let channels_active = IntGauge::with_opts(
            Opts::new("channels_active", "Channels currently polled by the receiver.")
                .namespace(NAMESPACE),
        )?;
        let channel_read_errors = IntCounter::with_opts(
            Opts::new(
                "channel_read_errors_total",
                "Channels dropped after a socket read error.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_dropped = IntCounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Events dropped because the destination queue was full.",
            )
            .namespace(NAMESPACE),
            &["queue"],
        )?;
        let ticks_processed = IntCounter::with_opts(
            Opts::new("ticks_processed_total", "Ticks handled by the aggregator.")
                .namespace(NAMESPACE),
        )?;
        let metrics_emitted = IntCounter::with_opts(
            Opts::new(
                "metrics_emitted_total",
                "Per-channel metrics computed by the aggregator.",
            )
            .namespace(NAMESPACE),
        )?;
        let sink_writes = IntCounterVec::new(
            Opts::new("sink_writes_total", "Metrics written by sink.").namespace(NAMESPACE),
            &["sink"],
        )?;
        let sink_errors = IntCounterVec::new(
            Opts::new("sink_errors_total", "Sink failures by sink and kind.")
                .namespace(NAMESPACE),
            &["sink", "kind"],
        )?;
        let sink_reconnects = IntCounterVec::new(
            Opts::new("sink_reconnects_total", "Sink reconnect attempts.").namespace(NAMESPACE),
            &["sink"],
        )?;

        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(channels_active.clone()))?;
        registry.register(Box::new(channel_read_errors.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(ticks_processed.clone()))?;
        registry.register(Box::new(metrics_emitted.clone()))?;
        registry.register(Box::new(sink_writes.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(sink_reconnects.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            packets_received,
            bytes_received,
            channels_active,
            channel_read_errors,
            events_dropped,
            ticks_processed,
            metrics_emitted,
            sink_writes,
            sink_errors,
            sink_reconnects,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" shorthand binds all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops the HTTP server, if running.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
