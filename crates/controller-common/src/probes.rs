//! Health, readiness and metrics endpoints

use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Readiness flag flipped once startup (credential check, recovery) is done
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Mark the controller ready
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the controller is ready
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    metrics: Metrics,
    readiness: Readiness,
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn metrics(State(state): State<ProbeState>) -> String {
    state.metrics.encode()
}

fn router(metrics: Metrics, readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ProbeState { metrics, readiness })
}

/// Serve the probe endpoints on `addr` until shutdown
pub async fn serve_probes(
    addr: SocketAddr,
    metrics: Metrics,
    readiness: Readiness,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);

    axum::serve(listener, router(metrics, readiness))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
