// Processor lifecycle endpoints

use super::wire::{
    ErrorBody, HeartbeatBody, ProcessorView, ProcessorsSnapshot, RegisterBody, RegisterResponse,
};
use super::{ControlError, ControlState};
use crate::error::FlowError;
use crate::registry::{HeartbeatOutcome, HeartbeatStats, RegistrationRequest};
use crate::telemetry;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::time::Duration;

/// Queue creation happens inside the request; bound it to the handler
/// budget so a wedged broker cannot hang registrations indefinitely
const ENSURE_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

fn to_registration(body: &RegisterBody) -> RegistrationRequest {
    RegistrationRequest {
        processor_id: body.processor_id.clone(),
        capabilities: body.capabilities.iter().cloned().collect(),
        capacity: body.capacity,
    }
}

/// `POST /processors` - idempotent registration
pub async fn register(
    State(state): State<ControlState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<RegisterResponse>, ControlError> {
    let descriptor = state.registry.register(to_registration(&body))?;

    let queue_name = tokio::time::timeout(
        ENSURE_QUEUE_TIMEOUT,
        state.queues.ensure_queue(&body.processor_id, body.queue_bound),
    )
    .await
    .map_err(|_| {
        FlowError::TransientTransport("queue creation timed out".to_string())
    })??;

    tracing::info!(
        processor_id = descriptor.processor_id,
        capabilities = ?descriptor.capabilities,
        capacity = descriptor.capacity,
        "processor registered"
    );
    Ok(Json(RegisterResponse { queue_name }))
}

/// `GET /processors` - registry snapshot with sampled queue depths
pub async fn list(State(state): State<ControlState>) -> Json<ProcessorsSnapshot> {
    let processors = state
        .registry
        .snapshot()
        .into_iter()
        .map(|descriptor| ProcessorView {
            queue_depth: state.backpressure.queue_depth(&descriptor.processor_id),
            descriptor,
        })
        .collect();
    Json(ProcessorsSnapshot { processors })
}

/// `DELETE /processors/{id}` - begins draining; 204 on success
pub async fn deregister(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, ControlError> {
    match state.registry.drain(&id) {
        Ok(()) => {
            tracing::info!(processor_id = id, "processor draining");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(FlowError::Validation(_)) => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("unknown processor '{id}'"),
            }),
        )
            .into_response()),
        Err(e) => Err(ControlError(e)),
    }
}

/// `POST /processors/{id}/heartbeat` - stats update; unknown ids
/// auto-register when the body carries a descriptor, else 404
pub async fn heartbeat(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Result<axum::response::Response, ControlError> {
    let stats = HeartbeatStats {
        inflight: body.inflight,
        consecutive_failures: body.consecutive_failures,
    };
    let descriptor = body.descriptor.as_ref().map(to_registration);

    match state.registry.heartbeat(&id, stats, descriptor)? {
        HeartbeatOutcome::Accepted(_) => {
            metrics::counter!(telemetry::HEARTBEATS).increment(1);
            // Self-healed registrations need their queue too; this is a
            // cache hit on every ordinary heartbeat
            let _ = tokio::time::timeout(
                ENSURE_QUEUE_TIMEOUT,
                state.queues.ensure_queue(&id, None),
            )
            .await;
            Ok(StatusCode::OK.into_response())
        }
        HeartbeatOutcome::Unknown => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("unknown processor '{id}' and heartbeat carried no descriptor"),
            }),
        )
            .into_response()),
    }
}
