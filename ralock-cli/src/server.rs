use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tower_http::cors::CorsLayer;

use ralock_core::coordinator::Coordinator;
use ralock_core::infrastructure_tcp::TcpMessenger;
use ralock_core::state::StateSnapshot;

use crate::handlers::*;

pub type AppState = Arc<Coordinator<TcpMessenger>>;

/// Read-only HTTP view of one node's protocol state.
pub async fn run(host: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);

    tracing::info!("Status server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind status server on {addr}"))?;

    axum::serve(listener, app).await.context("status server error")
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(node_state))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let snapshot = state.snapshot().await;
    Json(ApiResponse::ok(HealthResponse::from_snapshot(&snapshot)))
}

async fn node_state(State(state): State<AppState>) -> Json<ApiResponse<StateSnapshot>> {
    Json(ApiResponse::ok(state.snapshot().await))
}

async fn not_found() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::err("unknown endpoint; try /health or /state")),
    )
}
