use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::ServerState;

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

/// List the ONNX models visible to the server.
pub async fn models(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let models = state.models();
    Json(json!({
        "count": models.len(),
        "models": models,
    }))
}

/// Prometheus text exposition.
pub async fn metrics_exposition(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
