// Control plane - HTTP surface for registration, liveness and metrics
//
// A thin routing table over the registry and queue manager. Handlers stay
// small and synchronous apart from queue creation; every error maps onto
// the taxonomy's HTTP status (409 conflict, 400 validation, 503
// saturation/not-ready, 500 fallback).

mod health;
mod processors;
pub mod wire;

use crate::backpressure::BackpressureController;
use crate::consumer::StreamConsumer;
use crate::error::{FlowError, FlowResult};
use crate::queues::WorkQueueManager;
use crate::registry::Registry;
use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state injected into every handler
#[derive(Clone)]
pub struct ControlState {
    pub registry: Arc<Registry>,
    pub queues: Arc<WorkQueueManager>,
    pub backpressure: Arc<BackpressureController>,
    pub consumer: Arc<StreamConsumer>,
    pub metrics: PrometheusHandle,
}

/// Build the control-plane router
pub fn app(state: ControlState) -> Router {
    Router::new()
        .route(
            "/processors",
            post(processors::register).get(processors::list),
        )
        .route("/processors/:id", delete(processors::deregister))
        .route("/processors/:id/heartbeat", post(processors::heartbeat))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .with_state(state)
}

/// Bind and serve until the token cancels
pub async fn serve(state: ControlState, port: u16, token: CancellationToken) -> FlowResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| FlowError::Config(format!("cannot bind control plane port {port}: {e}")))?;
    tracing::info!(port, "control plane listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| FlowError::PermanentTransport(format!("control plane server: {e}")))?;

    tracing::info!("control plane shut down");
    Ok(())
}

/// Taxonomy-to-status mapping for handler errors
pub struct ControlError(pub FlowError);

impl From<FlowError> for ControlError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response<Body> {
        let status = match &self.0 {
            FlowError::Conflict(_) => StatusCode::CONFLICT,
            FlowError::Validation(_) => StatusCode::BAD_REQUEST,
            FlowError::Saturation(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("control plane error: {}", self.0);
        }
        (
            status,
            Json(wire::ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
