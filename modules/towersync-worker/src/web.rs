// Liveness, readiness and metrics endpoints. Health is 200 from process
// start; readiness flips once the bus subscription is established.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn health_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness))
        .with_state(ready)
        .layer(TraceLayer::new_for_http())
}

async fn readiness(State(ready): State<Arc<AtomicBool>>) -> StatusCode {
    if ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry)
}

async fn render_metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        );
    }
    (
        StatusCode::OK,
        String::from_utf8_lossy(&buffer).into_owned(),
    )
}

/// Serve a router until the shutdown channel fires.
pub async fn serve(router: Router, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Error binding port {port}"))?;
    info!(port, "HTTP endpoint listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("HTTP server error")
}
