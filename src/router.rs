// Router / distributor - fan out admitted frames to matching processors
//
// For each frame: derive the routing predicate, select targets from the
// registry, apply the backpressure verdict when everyone is saturated,
// write a copy (with a fresh child trace context) to every chosen queue,
// and only then let the worker ack the ingest entry. A failed write marks
// the target Unhealthy and triggers one re-selection round; entries that
// still cannot be placed stay unacked so the PEL redelivers them.
//
// Per-camera FIFO is soft: with more than one routing worker, frames from
// one camera may be reordered. Processors must not assume strict order.

use crate::backpressure::{BackpressureController, Verdict};
use crate::config::RouterConfig;
use crate::consumer::{IngestItem, StreamConsumer};
use crate::error::{Backoff, FlowError, FlowResult};
use crate::frame::FrameEvent;
use crate::queues::WorkQueueManager;
use crate::registry::{ProcessorDescriptor, Registry};
use crate::streams::Streams;
use crate::telemetry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Selection rounds before an entry is left for redelivery
const SELECT_ROUNDS: u32 = 2;
/// Worker-side retry cadence for delay verdicts
const DELAY_RETRY: Duration = Duration::from_millis(100);
const DELAY_ATTEMPTS: u32 = 3;

/// What happened to one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Written to every selected queue; ack the ingest entry
    Routed { targets: usize },
    /// Deliberately discarded; ack the ingest entry
    Dropped { reason: &'static str },
    /// Could not be placed right now; leave unacked for redelivery
    NotAdmitted,
}

/// Internal selection result: who to write to, or why not
enum Selection<'a> {
    Targets(Vec<&'a ProcessorDescriptor>),
    Delay,
}

pub struct Router {
    registry: Arc<Registry>,
    queues: Arc<WorkQueueManager>,
    backpressure: Arc<BackpressureController>,
    streams: Arc<dyn Streams>,
    cfg: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        queues: Arc<WorkQueueManager>,
        backpressure: Arc<BackpressureController>,
        streams: Arc<dyn Streams>,
        cfg: RouterConfig,
    ) -> Self {
        Self {
            registry,
            queues,
            backpressure,
            streams,
            cfg,
        }
    }

    /// Route one frame within the `route_timeout` budget
    pub async fn route(&self, frame: &FrameEvent) -> FlowResult<RouteOutcome> {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.cfg.route_timeout, self.route_inner(frame))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(telemetry::ROUTE_TIMEOUT).increment(1);
                tracing::warn!(frame_id = frame.frame_id, "routing timed out");
                Ok(RouteOutcome::NotAdmitted)
            }
        };
        metrics::histogram!(telemetry::ROUTE_DURATION).record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn route_inner(&self, frame: &FrameEvent) -> FlowResult<RouteOutcome> {
        let predicate = frame.required_capabilities();

        if predicate.is_empty()
            && self.cfg.empty_predicate == crate::config::EmptyPredicate::Drop
        {
            return Ok(self.drop_frame(frame, "empty_predicate"));
        }

        // The routing hop's own context; every queue write gets a child of
        // it so all copies share the frame's trace id
        let route_ctx = frame.trace_context.child();
        tracing::debug!(
            frame_id = frame.frame_id,
            trace_id = route_ctx.trace_id().as_deref().unwrap_or(""),
            "routing frame"
        );

        let mut written: HashSet<String> = HashSet::new();

        for round in 0..SELECT_ROUNDS {
            let candidates = self.registry.match_capabilities(&predicate);

            if candidates.is_empty() {
                if !predicate.is_empty() {
                    return Ok(self.drop_frame(frame, "no_match"));
                }
                // Broadcast with an empty fleet: hold the frame until a
                // processor joins rather than silently losing the feed
                return Ok(RouteOutcome::NotAdmitted);
            }

            let targets = match self.select(frame, &candidates) {
                Selection::Targets(targets) => targets,
                Selection::Delay => return Ok(RouteOutcome::NotAdmitted),
            };
            let targets: Vec<&ProcessorDescriptor> = targets
                .into_iter()
                .filter(|d| !written.contains(&d.processor_id))
                .collect();

            // Fan out concurrently; each copy carries its own child context
            let writes = targets.iter().map(|descriptor| {
                let frame_copy = frame.with_trace_context(route_ctx.child());
                async move {
                    let result = self.write_queue(descriptor, &frame_copy).await;
                    (*descriptor, result)
                }
            });

            let mut any_failed = false;
            for (descriptor, result) in futures::future::join_all(writes).await {
                match result {
                    Ok(()) => {
                        written.insert(descriptor.processor_id.clone());
                    }
                    Err(e) => {
                        any_failed = true;
                        let failures =
                            self.registry.record_write_failure(&descriptor.processor_id);
                        tracing::warn!(
                            processor_id = descriptor.processor_id,
                            failures,
                            "queue write failed, marking Unhealthy: {e}"
                        );
                        self.registry
                            .mark_unhealthy(&descriptor.processor_id, "queue write failure");
                    }
                }
            }

            if !any_failed {
                return Ok(RouteOutcome::Routed {
                    targets: written.len(),
                });
            }
            tracing::debug!(round, "re-selecting after write failure");
        }

        // A target kept failing across both rounds; the ingest PEL will
        // redeliver. Copies already written are the documented
        // at-least-once duplication.
        Ok(RouteOutcome::NotAdmitted)
    }

    /// Apply saturation filtering and, when the whole candidate set is
    /// saturated, the backpressure verdict. Candidates arrive pre-sorted
    /// by the registry's selection score.
    fn select<'a>(
        &self,
        frame: &FrameEvent,
        candidates: &'a [ProcessorDescriptor],
    ) -> Selection<'a> {
        let unsaturated: Vec<&ProcessorDescriptor> = candidates
            .iter()
            .filter(|d| !d.is_saturated(self.cfg.soft_overflow_factor))
            .collect();

        if !unsaturated.is_empty() {
            return Selection::Targets(unsaturated);
        }

        match self.backpressure.verdict(frame) {
            Verdict::Spill => {
                // Least-loaded saturated target that still has hard
                // headroom; the hard cap is the bounded-inflight invariant
                match candidates
                    .iter()
                    .find(|d| d.has_hard_headroom(self.cfg.hard_overflow_factor))
                {
                    Some(spill) => {
                        metrics::counter!(telemetry::ADMISSION_SPILL).increment(1);
                        tracing::debug!(
                            frame_id = frame.frame_id,
                            processor_id = spill.processor_id,
                            "spilling high-priority frame onto saturated processor"
                        );
                        Selection::Targets(vec![spill])
                    }
                    // Everything at the hard cap: nothing may admit
                    None => Selection::Delay,
                }
            }
            Verdict::Delay => {
                tracing::trace!(frame_id = frame.frame_id, "delaying frame, fleet saturated");
                Selection::Delay
            }
        }
    }

    /// Write one frame copy with the per-queue retry budget
    async fn write_queue(
        &self,
        descriptor: &ProcessorDescriptor,
        frame: &FrameEvent,
    ) -> FlowResult<()> {
        let bound = self.queues.bound(&descriptor.processor_id);
        let fields = frame.to_fields();
        let mut backoff = Backoff::new();
        let mut last_err: Option<FlowError> = None;

        for attempt in 0..=self.cfg.write_retries {
            if attempt > 0 {
                metrics::counter!(telemetry::DISPATCH_RETRIES).increment(1);
                tokio::time::sleep(backoff.next_delay()).await;
            }
            match self
                .streams
                .add(&descriptor.queue_name, &fields, Some(bound))
                .await
            {
                Ok(reply) => {
                    if reply.trimmed > 0 {
                        metrics::counter!(telemetry::FRAMES_DROPPED, "reason" => "queue_full")
                            .increment(reply.trimmed);
                        tracing::warn!(
                            processor_id = descriptor.processor_id,
                            trimmed = reply.trimmed,
                            bound,
                            "work queue at bound, trimmed oldest entries"
                        );
                    }
                    self.registry.record_write_success(&descriptor.processor_id);
                    self.registry.record_dispatch(&descriptor.processor_id);
                    self.backpressure.note_write(&descriptor.processor_id);
                    metrics::counter!(telemetry::FRAMES_ROUTED).increment(1);
                    return Ok(());
                }
                Err(e) if e.is_transient() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| FlowError::TransientTransport("write retries exhausted".into())))
    }

    fn drop_frame(&self, frame: &FrameEvent, reason: &'static str) -> RouteOutcome {
        metrics::counter!(telemetry::FRAMES_DROPPED, "reason" => reason).increment(1);
        tracing::debug!(frame_id = frame.frame_id, reason, "dropping frame");
        RouteOutcome::Dropped { reason }
    }

    /// One routing worker: pull decoded frames off the shared channel,
    /// route, and ack on any terminal outcome. Delay verdicts retry a few
    /// times before leaving the entry to PEL redelivery.
    pub async fn run_worker(
        self: Arc<Self>,
        rx: Arc<Mutex<mpsc::Receiver<IngestItem>>>,
        consumer: Arc<StreamConsumer>,
        token: CancellationToken,
    ) {
        loop {
            let item = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = item else { break };

            let mut outcome = RouteOutcome::NotAdmitted;
            for attempt in 0..DELAY_ATTEMPTS {
                match self.route(&item.frame).await {
                    Ok(RouteOutcome::NotAdmitted) => {
                        if attempt + 1 < DELAY_ATTEMPTS {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(DELAY_RETRY) => {}
                            }
                        }
                    }
                    Ok(done) => {
                        outcome = done;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            frame_id = item.frame.frame_id,
                            "routing error, leaving entry for redelivery: {e}"
                        );
                        break;
                    }
                }
            }

            match outcome {
                RouteOutcome::Routed { .. } | RouteOutcome::Dropped { .. } => {
                    if let Err(e) = consumer.ack(&item.entry_id).await {
                        tracing::warn!(entry_id = item.entry_id, "ack failed: {e}");
                    }
                }
                RouteOutcome::NotAdmitted => {
                    // Unacked on purpose: the PEL owns it now
                }
            }
        }
        tracing::debug!("router worker stopped");
    }
}
