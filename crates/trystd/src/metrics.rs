use crate::server::ServerState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tryst_common::Mode;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    connections: usize,
    pairs: usize,
    queues: QueueSizes,
}

/// Queue depths per mode.
#[derive(Serialize)]
struct QueueSizes {
    text: usize,
    video: usize,
    voice: usize,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct OpsState {
    server: Arc<ServerState>,
    health: HealthState,
}

/// # Errors
///
/// Returns an error if binding the ops HTTP server fails.
pub async fn start_ops_server(
    addr: SocketAddr,
    server: Arc<ServerState>,
    health: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(OpsState { server, health });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("ops server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - reports process status and the live state surfaces.
async fn health_handler(State(state): State<OpsState>) -> (StatusCode, Json<HealthResponse>) {
    let server = &state.server;
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            uptime_seconds: server.started_at.elapsed().as_secs(),
            connections: server.registry.count(),
            pairs: server.pairing.pair_count(),
            queues: QueueSizes {
                text: server.queue.queue_len(Mode::Text),
                video: server.queue.queue_len(Mode::Video),
                voice: server.queue.queue_len(Mode::Voice),
            },
        }),
    )
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(State(state): State<OpsState>) -> (StatusCode, Json<ReadyResponse>) {
    if state.health.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Connection and pair gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("tryst_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("tryst_connections_active").decrement(1.0);
    }

    /// Increment the active pairs gauge.
    pub fn inc_pairs_active() {
        metrics::gauge!("tryst_pairs_active").increment(1.0);
    }

    /// Decrement the active pairs gauge.
    pub fn dec_pairs_active() {
        metrics::gauge!("tryst_pairs_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record an admission attempt with the given status label.
    pub fn admissions_total(status: &'static str) {
        metrics::counter!("tryst_admissions_total", "status" => status).increment(1);
    }

    /// Record a completed match in the given mode.
    pub fn matches_total(mode: &'static str) {
        metrics::counter!("tryst_matches_total", "mode" => mode).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("tryst_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("tryst_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record accepted abuse reports.
    pub fn reports_total() {
        metrics::counter!("tryst_reports_total").increment(1);
    }

    /// Record an IP ban with the given reason label.
    pub fn bans_total(reason: &'static str) {
        metrics::counter!("tryst_bans_total", "reason" => reason).increment(1);
    }

    /// Record queue entries dropped by the timeout sweeper.
    pub fn queue_timeouts_total(count: u64) {
        metrics::counter!("tryst_queue_timeouts_total").increment(count);
    }

    /// Record a completed mode switch.
    pub fn mode_switches_total() {
        metrics::counter!("tryst_mode_switches_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long the first-popped user waited for a match.
    pub fn match_wait_seconds(value: f64) {
        metrics::histogram!("tryst_match_wait_seconds").record(value);
    }

    /// Record end-to-end frame handling time in seconds.
    pub fn frame_handle_seconds(value: f64) {
        metrics::histogram!("tryst_frame_handle_seconds").record(value);
    }
}
