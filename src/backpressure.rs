// Backpressure controller - centralised admission policy
//
// The router asks one question ("all my candidates are saturated, what
// now?") and the controller answers spill or delay from the frame's
// priority. Everything else here is sampling: ingest PEL depth gates new
// reads, queue depths feed the gauges, and a failure streak past the
// threshold demotes the processor.

use crate::config::ConsumerConfig;
use crate::frame::FrameEvent;
use crate::queues::WorkQueueManager;
use crate::registry::Registry;
use crate::streams::Streams;
use crate::telemetry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Priority at or above which a saturated fleet still admits via spill
pub const SPILL_PRIORITY_MIN: u8 = 7;

/// What to do with a frame whose candidates are all saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Admit onto the least-loaded saturated processor
    Spill,
    /// Leave unacked; the entry redelivers once load relaxes
    Delay,
}

pub struct BackpressureController {
    pel_pause: u64,
    failure_threshold: u32,
    ingest_pel: AtomicU64,
    paused: AtomicBool,
    /// Sampled queue depths, refreshed by the sampler and nudged by the
    /// router on each write
    depths: Mutex<HashMap<String, u64>>,
}

impl BackpressureController {
    pub fn new(consumer: &ConsumerConfig, failure_threshold: u32) -> Self {
        Self {
            pel_pause: consumer.pel_pause,
            failure_threshold,
            ingest_pel: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            depths: Mutex::new(HashMap::new()),
        }
    }

    /// Saturation verdict for one frame
    pub fn verdict(&self, frame: &FrameEvent) -> Verdict {
        if frame.priority() >= SPILL_PRIORITY_MIN {
            Verdict::Spill
        } else {
            Verdict::Delay
        }
    }

    /// True while ingest reads should stay paused
    pub fn admission_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Record a fresh ingest PEL sample and derive the pause flag
    pub fn note_ingest_pel(&self, depth: u64) {
        self.ingest_pel.store(depth, Ordering::Relaxed);
        let paused = depth >= self.pel_pause;
        let was = self.paused.swap(paused, Ordering::Relaxed);
        if paused != was {
            if paused {
                tracing::warn!(depth, threshold = self.pel_pause, "pausing ingest reads on PEL pressure");
            } else {
                tracing::info!(depth, "resuming ingest reads");
            }
        }
        metrics::gauge!(telemetry::INGEST_PEL_DEPTH).set(depth as f64);
        metrics::gauge!(telemetry::ADMISSION_PAUSED).set(if paused { 1.0 } else { 0.0 });
    }

    /// Router-side nudge after a successful queue write
    pub fn note_write(&self, processor_id: &str) {
        let mut depths = self.depths.lock().expect("depths lock");
        *depths.entry(processor_id.to_string()).or_default() += 1;
    }

    /// Sampled depth for one queue (0 when never sampled)
    pub fn queue_depth(&self, processor_id: &str) -> u64 {
        self.depths
            .lock()
            .expect("depths lock")
            .get(processor_id)
            .copied()
            .unwrap_or(0)
    }

    fn store_depth(&self, processor_id: &str, depth: u64) {
        self.depths
            .lock()
            .expect("depths lock")
            .insert(processor_id.to_string(), depth);
        metrics::gauge!(telemetry::QUEUE_DEPTH, "processor_id" => processor_id.to_string())
            .set(depth as f64);
    }

    /// Periodic sampling loop: ingest PEL depth, per-processor queue
    /// lengths, and the consecutive-failure rule from the admission table.
    pub async fn run_sampler(
        self: Arc<Self>,
        streams: Arc<dyn Streams>,
        queues: Arc<WorkQueueManager>,
        registry: Arc<Registry>,
        ingest_stream: String,
        ingest_group: String,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }

            match streams.pending_count(&ingest_stream, &ingest_group).await {
                Ok(depth) => self.note_ingest_pel(depth),
                Err(e) => tracing::debug!("ingest PEL sample failed: {e}"),
            }

            for descriptor in registry.snapshot() {
                match queues.length(&descriptor.processor_id).await {
                    Ok(depth) => self.store_depth(&descriptor.processor_id, depth),
                    Err(e) => {
                        tracing::debug!(
                            processor_id = descriptor.processor_id,
                            "queue depth sample failed: {e}"
                        );
                    }
                }

                if descriptor.consecutive_failures >= self.failure_threshold {
                    registry.mark_unhealthy(
                        &descriptor.processor_id,
                        &format!("{} consecutive failures", descriptor.consecutive_failures),
                    );
                }
            }
        }
        tracing::debug!("backpressure sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tracectx::TraceContext;
    use chrono::Utc;
    use serde_json::json;

    fn frame_with_priority(priority: Option<u8>) -> FrameEvent {
        let mut metadata = serde_json::Map::new();
        if let Some(p) = priority {
            metadata.insert("priority".to_string(), json!(p));
        }
        FrameEvent {
            frame_id: "t_c_1".to_string(),
            camera_id: "c".to_string(),
            timestamp: Utc::now(),
            size_bytes: 0,
            width: 0,
            height: 0,
            format: String::new(),
            content_ref: None,
            trace_context: TraceContext::empty(),
            metadata,
        }
    }

    fn controller() -> BackpressureController {
        let cfg = Config::default();
        BackpressureController::new(&cfg.consumer, cfg.registry.failure_threshold)
    }

    #[test]
    fn high_priority_spills_low_priority_delays() {
        let bp = controller();
        assert_eq!(bp.verdict(&frame_with_priority(Some(8))), Verdict::Spill);
        assert_eq!(bp.verdict(&frame_with_priority(Some(7))), Verdict::Spill);
        assert_eq!(bp.verdict(&frame_with_priority(Some(3))), Verdict::Delay);
        // Default priority 5 delays
        assert_eq!(bp.verdict(&frame_with_priority(None)), Verdict::Delay);
    }

    #[test]
    fn pel_threshold_toggles_pause() {
        let bp = controller();
        assert!(!bp.admission_paused());

        bp.note_ingest_pel(80_000);
        assert!(bp.admission_paused());

        bp.note_ingest_pel(10);
        assert!(!bp.admission_paused());
    }

    #[test]
    fn write_nudges_accumulate_until_resampled() {
        let bp = controller();
        bp.note_write("p1");
        bp.note_write("p1");
        assert_eq!(bp.queue_depth("p1"), 2);
        bp.store_depth("p1", 1);
        assert_eq!(bp.queue_depth("p1"), 1);
    }
}
