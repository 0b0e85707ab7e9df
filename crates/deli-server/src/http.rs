//! `/metrics` and `/health` endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing, Router,
};
use deli_sequencer::{LifecycleState, ServiceHandle};
use std::net::SocketAddr;
use tracing::info;

pub fn router(handle: ServiceHandle) -> Router {
    Router::new()
        .route("/metrics", routing::get(metrics))
        .route("/health", routing::get(health))
        .with_state(handle)
}

pub async fn serve(addr: SocketAddr, handle: ServiceHandle) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics endpoint listening");
    axum::serve(listener, router(handle)).await?;
    Ok(())
}

async fn metrics(State(handle): State<ServiceHandle>) -> impl IntoResponse {
    match handle.metrics().export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("Error generating metrics: {}", e),
        ),
    }
}

async fn health(State(handle): State<ServiceHandle>) -> (StatusCode, String) {
    let state = handle.state();
    let status = match state {
        LifecycleState::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        format!(
            "{} (queued={}, sequencers={}, checkpoint={})",
            state,
            handle.queue_depth(),
            handle.sequencers(),
            handle.checkpoint_phase()
        ),
    )
}
