// Telemetry - metric names and the Prometheus recorder
//
// One place owns the metric name strings so dashboards and tests never
// chase typos. The recorder is installed once at startup; the control
// plane renders the handle on /metrics.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// Orchestrator side
pub const FRAMES_INGESTED: &str = "frames_ingested_total";
pub const FRAMES_ROUTED: &str = "frames_routed_total";
pub const FRAMES_DROPPED: &str = "frames_dropped_total";
pub const ADMISSION_SPILL: &str = "admission_spill_total";
pub const ADMISSION_PAUSED: &str = "admission_paused";
pub const ROUTE_TIMEOUT: &str = "route_timeout_total";
pub const ROUTE_DURATION: &str = "route_duration_seconds";
pub const DISPATCH_RETRIES: &str = "dispatch_write_retries_total";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const INGEST_PEL_DEPTH: &str = "ingest_pel_depth";
pub const REGISTRY_PROCESSORS: &str = "registry_processors";
pub const PROCESSOR_STATE: &str = "processor_state";
pub const HEARTBEATS: &str = "heartbeats_total";

// Processor-client side
pub const FRAMES_PROCESSED: &str = "frames_processed_total";
pub const FRAMES_FAILED: &str = "frames_failed_total";
pub const FRAMES_DEAD_LETTERED: &str = "frames_dead_lettered_total";

/// Install the Prometheus recorder and describe the metric families.
///
/// Must be called once, before any task emits a metric; the returned
/// handle renders the scrape body.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(FRAMES_INGESTED, "Frame events read from the ingest stream");
    describe_counter!(FRAMES_ROUTED, "Frame copies written to processor queues");
    describe_counter!(
        FRAMES_DROPPED,
        "Frames discarded, labelled by reason (no_match, queue_full, malformed, empty_predicate)"
    );
    describe_counter!(ADMISSION_SPILL, "Frames spilled onto a saturated processor");
    describe_gauge!(ADMISSION_PAUSED, "1 while ingest reads are paused on PEL pressure");
    describe_counter!(ROUTE_TIMEOUT, "Routing attempts abandoned at route_timeout");
    describe_histogram!(ROUTE_DURATION, "Seconds spent routing one frame");
    describe_counter!(DISPATCH_RETRIES, "Queue write retries after transient failures");
    describe_gauge!(QUEUE_DEPTH, "Sampled work-queue length per processor");
    describe_gauge!(INGEST_PEL_DEPTH, "Delivered-but-unacked ingest entries");
    describe_gauge!(REGISTRY_PROCESSORS, "Registered processors by state");
    describe_gauge!(PROCESSOR_STATE, "Per-processor state indicator");
    describe_counter!(HEARTBEATS, "Heartbeats accepted by the control plane");
    describe_counter!(FRAMES_PROCESSED, "Frames acked by processor handlers");
    describe_counter!(FRAMES_FAILED, "Handler failures (entry left for redelivery)");
    describe_counter!(FRAMES_DEAD_LETTERED, "Entries parked on a dead-letter stream");

    Ok(handle)
}
