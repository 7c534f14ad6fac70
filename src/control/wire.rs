// Wire types shared by the control plane and the processor client

use crate::registry::ProcessorDescriptor;
use serde::{Deserialize, Serialize};

/// Body of `POST /processors`, also embedded in heartbeats for
/// self-healing registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBody {
    pub processor_id: String,
    pub capabilities: Vec<String>,
    pub capacity: u32,
    /// Work-queue bound override; orchestrator default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_bound: Option<u64>,
}

/// `200` response to a registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub queue_name: String,
}

/// Body of `POST /processors/{id}/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub inflight: u32,
    pub consecutive_failures: u32,
    /// Optional descriptor; lets the registry auto-register an id it lost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<RegisterBody>,
}

/// One registry entry in the `GET /processors` snapshot, enriched with the
/// sampled queue depth
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorView {
    #[serde(flatten)]
    pub descriptor: ProcessorDescriptor,
    pub queue_depth: u64,
}

/// `GET /processors` response
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorsSnapshot {
    pub processors: Vec<ProcessorView>,
}

/// Error body for every non-2xx control-plane response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
