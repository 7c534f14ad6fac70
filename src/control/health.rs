// Liveness, readiness and metrics endpoints

use super::ControlState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /health` - 200 while the stream consumer loop is alive
pub async fn health(State(state): State<ControlState>) -> impl IntoResponse {
    if state.consumer.is_running() {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "consumer stopped"})))
    }
}

/// `GET /ready` - 200 once ingest is connected and at least one processor
/// is Active; 503 otherwise
pub async fn ready(State(state): State<ControlState>) -> impl IntoResponse {
    let ingest_up = state.consumer.is_connected();
    let active = state.registry.active_count();

    if ingest_up && active >= 1 {
        (StatusCode::OK, Json(json!({"status": "ready", "active_processors": active})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "ingest_connected": ingest_up,
                "active_processors": active,
            })),
        )
    }
}

/// `GET /metrics` - Prometheus text exposition
pub async fn metrics(State(state): State<ControlState>) -> String {
    state.metrics.render()
}
