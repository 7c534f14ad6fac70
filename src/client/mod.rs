// Processor client - the library every processor embeds
//
// One abstraction for processor authors: register, then "give me frames,
// I return results". The client posts its registration to the control
// plane, keeps a heartbeat loop alive, reads its own queue as a member of
// the shared consumer group, invokes the user handler on a bounded worker
// pool and acks on success. Failed handlers leave the entry pending; after
// the redelivery budget it is parked on the processor's dead-letter
// stream.
//
// The client survives orchestrator outages: heartbeats fail quietly while
// queue consumption continues (the broker is a separate system), and the
// next successful heartbeat or re-registration self-heals the registry
// entry. Ack order is not preserved across the worker pool; this is
// intentional.

use crate::config::{dlq_name, queue_name, ClientDefaults, PROCESSED_STREAM, PROCESSOR_GROUP};
use crate::control::wire::{HeartbeatBody, RegisterBody, RegisterResponse};
use crate::error::{Backoff, FlowError, FlowResult};
use crate::frame::{FrameEvent, ProcessedFrame, F_FAILURE_REASON};
use crate::streams::{ClaimedEntry, RedisStreams, StreamEntry, Streams};
use crate::telemetry;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Registration call budget, tighter than ordinary requests
const REGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything a processor needs to say about itself
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane base URL, e.g. http://orchestrator:8002
    pub orchestrator_endpoint: String,
    /// Broker endpoint for queue reads
    pub stream_endpoint: String,
    pub processor_id: String,
    pub capabilities: BTreeSet<String>,
    /// Max in-flight frames this processor claims it can hold
    pub capacity: u32,
    /// Work-queue bound override; orchestrator default when None
    pub queue_bound: Option<u64>,

    pub heartbeat_interval: Duration,
    pub batch_size: usize,
    /// Blocking read budget per poll
    pub block: Duration,
    pub handler_concurrency: usize,
    /// Deliveries before an entry is dead-lettered
    pub max_redeliveries: u64,
    /// Idle age at which this client claims abandoned peer entries
    pub pel_reclaim: Duration,
    /// Continuous read failure beyond this is fatal (exit for restart)
    pub read_fatal_after: Duration,
}

impl ClientConfig {
    pub fn new(
        orchestrator_endpoint: impl Into<String>,
        stream_endpoint: impl Into<String>,
        processor_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        capacity: u32,
    ) -> Self {
        let defaults = ClientDefaults {
            heartbeat_interval: Duration::from_secs(5),
            handler_concurrency: 4,
            max_redeliveries: 5,
            batch_size: 16,
            read_fatal_after: Duration::from_secs(60),
        };
        Self::with_defaults(
            orchestrator_endpoint,
            stream_endpoint,
            processor_id,
            capabilities,
            capacity,
            &defaults,
        )
    }

    pub fn with_defaults(
        orchestrator_endpoint: impl Into<String>,
        stream_endpoint: impl Into<String>,
        processor_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        capacity: u32,
        defaults: &ClientDefaults,
    ) -> Self {
        Self {
            orchestrator_endpoint: orchestrator_endpoint.into(),
            stream_endpoint: stream_endpoint.into(),
            processor_id: processor_id.into(),
            capabilities: capabilities.into_iter().collect(),
            capacity,
            queue_bound: None,
            heartbeat_interval: defaults.heartbeat_interval,
            batch_size: defaults.batch_size,
            block: Duration::from_millis(1000),
            handler_concurrency: defaults.handler_concurrency,
            max_redeliveries: defaults.max_redeliveries,
            pel_reclaim: Duration::from_millis(60_000),
            read_fatal_after: defaults.read_fatal_after,
        }
    }
}

pub struct ProcessorClient {
    cfg: ClientConfig,
    http: reqwest::Client,
    streams: Arc<dyn Streams>,
    queue: String,
    inflight: Arc<AtomicU32>,
    consecutive_failures: Arc<AtomicU32>,
    token: CancellationToken,
}

impl ProcessorClient {
    /// Connect to the broker named in the config
    pub async fn connect(cfg: ClientConfig) -> FlowResult<Self> {
        let streams = Arc::new(RedisStreams::connect(&cfg.stream_endpoint).await?);
        Ok(Self::with_streams(cfg, streams))
    }

    /// Build against an existing backend (tests, demo mode)
    pub fn with_streams(cfg: ClientConfig, streams: Arc<dyn Streams>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let queue = queue_name(&cfg.processor_id);
        Self {
            cfg,
            http,
            streams,
            queue,
            inflight: Arc::new(AtomicU32::new(0)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            token: CancellationToken::new(),
        }
    }

    fn register_body(&self) -> RegisterBody {
        RegisterBody {
            processor_id: self.cfg.processor_id.clone(),
            capabilities: self.cfg.capabilities.iter().cloned().collect(),
            capacity: self.cfg.capacity,
            queue_bound: self.cfg.queue_bound,
        }
    }

    /// Register with the control plane and start the heartbeat loop.
    ///
    /// A 409 means another live processor owns this id with different
    /// capabilities; that is an operator error, not something to retry.
    pub async fn register(&self) -> FlowResult<()> {
        let url = format!("{}/processors", self.cfg.orchestrator_endpoint);
        let response = self
            .http
            .post(&url)
            .timeout(REGISTER_TIMEOUT)
            .json(&self.register_body())
            .send()
            .await
            .map_err(|e| FlowError::TransientTransport(format!("registration failed: {e}")))?;

        match response.status().as_u16() {
            200 => {
                let body: RegisterResponse = response.json().await.map_err(|e| {
                    FlowError::TransientTransport(format!("bad registration response: {e}"))
                })?;
                if body.queue_name != self.queue {
                    tracing::warn!(
                        assigned = body.queue_name,
                        expected = self.queue,
                        "orchestrator assigned an unexpected queue name"
                    );
                }
                tracing::info!(
                    processor_id = self.cfg.processor_id,
                    queue = body.queue_name,
                    "registered with orchestrator"
                );
                self.spawn_heartbeat_loop();
                Ok(())
            }
            409 => Err(FlowError::Conflict(format!(
                "processor id '{}' already registered with different capabilities",
                self.cfg.processor_id
            ))),
            status => Err(FlowError::TransientTransport(format!(
                "registration returned {status}"
            ))),
        }
    }

    fn spawn_heartbeat_loop(&self) {
        let http = self.http.clone();
        let cfg = self.cfg.clone();
        let inflight = self.inflight.clone();
        let failures = self.consecutive_failures.clone();
        let token = self.token.clone();
        let register_body = self.register_body();

        tokio::spawn(async move {
            let hb_url = format!(
                "{}/processors/{}/heartbeat",
                cfg.orchestrator_endpoint, cfg.processor_id
            );
            let mut tick = tokio::time::interval(cfg.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let body = HeartbeatBody {
                    inflight: inflight.load(Ordering::Relaxed),
                    consecutive_failures: failures.load(Ordering::Relaxed),
                    // Carried so an orchestrator that lost us (restart,
                    // eviction) can auto-register from the heartbeat alone
                    descriptor: Some(register_body.clone()),
                };

                match http.post(&hb_url).json(&body).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        tracing::warn!(
                            status = response.status().as_u16(),
                            "heartbeat rejected"
                        );
                    }
                    Err(e) => {
                        // Orchestrator outage: keep consuming, the queue is
                        // external; registration heals on reconnect
                        tracing::debug!("heartbeat failed: {e}");
                    }
                }
            }
            tracing::debug!("heartbeat loop stopped");
        });
    }

    /// Long-running consume loop.
    ///
    /// The handler runs on a pool of `handler_concurrency` workers. A
    /// handler returning `Ok(Some(payload))` also emits a processed-frame
    /// record downstream. A handler error leaves the entry unacked: it
    /// redelivers (here or on a peer) until `max_redeliveries`, then parks
    /// on the dead-letter stream.
    pub async fn consume<F, Fut>(&self, handler: F) -> FlowResult<()>
    where
        F: Fn(FrameEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<Option<Value>>> + Send + 'static,
    {
        self.streams
            .create_group(&self.queue, PROCESSOR_GROUP, crate::streams::GroupStart::NewOnly)
            .await?;

        let handler = Arc::new(handler);
        let pool = Arc::new(Semaphore::new(self.cfg.handler_concurrency));
        let mut backoff = Backoff::new();
        let mut failing_since: Option<Instant> = None;

        loop {
            if self.token.is_cancelled() {
                break;
            }

            // Recover abandoned entries first; anything past the
            // redelivery budget goes to the dead-letter stream instead of
            // looping forever
            let claimed = match self
                .streams
                .claim_idle(
                    &self.queue,
                    PROCESSOR_GROUP,
                    &self.cfg.processor_id,
                    self.cfg.pel_reclaim,
                    self.cfg.batch_size,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.note_read_failure(&mut failing_since, &mut backoff, e)
                        .await?;
                    continue;
                }
            };

            let mut workable: Vec<StreamEntry> = Vec::new();
            for ClaimedEntry { entry, deliveries } in claimed {
                if deliveries > self.cfg.max_redeliveries {
                    self.dead_letter(&entry, "redelivery budget exhausted").await;
                } else {
                    workable.push(entry);
                }
            }

            let fresh = match self
                .streams
                .read_group(
                    &self.queue,
                    PROCESSOR_GROUP,
                    &self.cfg.processor_id,
                    self.cfg.batch_size,
                    self.cfg.block,
                )
                .await
            {
                Ok(fresh) => fresh,
                Err(e) => {
                    self.note_read_failure(&mut failing_since, &mut backoff, e)
                        .await?;
                    continue;
                }
            };
            failing_since = None;
            backoff.reset();
            workable.extend(fresh);

            for entry in workable {
                let permit = match pool.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                self.spawn_handler(entry, handler.clone(), permit);
            }
        }

        // Let in-flight handlers settle before returning
        let _ = pool
            .acquire_many(self.cfg.handler_concurrency as u32)
            .await;
        Ok(())
    }

    fn spawn_handler<F, Fut>(
        &self,
        entry: StreamEntry,
        handler: Arc<F>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) where
        F: Fn(FrameEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<Option<Value>>> + Send + 'static,
    {
        let streams = self.streams.clone();
        let queue = self.queue.clone();
        let dlq = dlq_name(&self.cfg.processor_id);
        let processor_id = self.cfg.processor_id.clone();
        let inflight = self.inflight.clone();
        let failures = self.consecutive_failures.clone();

        inflight.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _permit = permit;

            let frame = match FrameEvent::from_fields(&entry.fields) {
                Ok(frame) => frame,
                Err(e) => {
                    // Not retryable: park and ack so the PEL drains
                    tracing::warn!(entry_id = entry.id, "malformed queue entry: {e}");
                    metrics::counter!(telemetry::FRAMES_DEAD_LETTERED).increment(1);
                    let mut fields: Vec<(String, String)> =
                        entry.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    fields.push((F_FAILURE_REASON.to_string(), e.to_string()));
                    let _ = streams.add(&dlq, &fields, None).await;
                    let _ = streams.ack(&queue, PROCESSOR_GROUP, &entry.id).await;
                    inflight.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            // The handler hop gets its own span in the frame's trace
            let handler_frame = frame.with_trace_context(frame.trace_context.child());
            let result = handler(handler_frame.clone()).await;

            match result {
                Ok(payload) => {
                    if let Some(payload) = payload {
                        let record = ProcessedFrame {
                            frame_id: frame.frame_id.clone(),
                            processor_id: processor_id.clone(),
                            result: payload,
                            trace_context: handler_frame.trace_context.child(),
                        };
                        if let Err(e) =
                            streams.add(PROCESSED_STREAM, &record.to_fields(), None).await
                        {
                            tracing::warn!(frame_id = frame.frame_id, "result write failed: {e}");
                        }
                    }
                    if let Err(e) = streams.ack(&queue, PROCESSOR_GROUP, &entry.id).await {
                        tracing::warn!(entry_id = entry.id, "ack failed: {e}");
                    } else {
                        metrics::counter!(telemetry::FRAMES_PROCESSED).increment(1);
                        failures.store(0, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    // No ack: the entry redelivers after pel_reclaim
                    metrics::counter!(telemetry::FRAMES_FAILED).increment(1);
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(frame_id = frame.frame_id, "handler failed: {e}");
                }
            }
            inflight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Track a read failure; fatal once the outage outlives
    /// `read_fatal_after` so a supervisor can restart the process
    async fn note_read_failure(
        &self,
        failing_since: &mut Option<Instant>,
        backoff: &mut Backoff,
        error: FlowError,
    ) -> FlowResult<()> {
        let since = failing_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.cfg.read_fatal_after {
            return Err(FlowError::PermanentTransport(format!(
                "queue reads failing for {:?}: {error}",
                since.elapsed()
            )));
        }
        let delay = backoff.next_delay();
        tracing::warn!("queue read failed, retrying in {delay:?}: {error}");
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) {
        tracing::warn!(entry_id = entry.id, reason, "dead-lettering entry");
        metrics::counter!(telemetry::FRAMES_DEAD_LETTERED).increment(1);

        let mut fields: Vec<(String, String)> = entry
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push((F_FAILURE_REASON.to_string(), reason.to_string()));

        let dlq = dlq_name(&self.cfg.processor_id);
        if self.streams.add(&dlq, &fields, None).await.is_ok() {
            let _ = self
                .streams
                .ack(&self.queue, PROCESSOR_GROUP, &entry.id)
                .await;
        }
    }

    /// Emit a processed-frame record with the trace context inherited from
    /// the consumed frame
    pub async fn result(&self, frame: &FrameEvent, payload: Value) -> FlowResult<()> {
        let record = ProcessedFrame {
            frame_id: frame.frame_id.clone(),
            processor_id: self.cfg.processor_id.clone(),
            result: payload,
            trace_context: frame.trace_context.child(),
        };
        self.streams
            .add(PROCESSED_STREAM, &record.to_fields(), None)
            .await?;
        Ok(())
    }

    /// Graceful exit: ask the control plane to drain, wait for in-flight
    /// handlers, stop the loops
    pub async fn shutdown(&self) -> FlowResult<()> {
        let url = format!(
            "{}/processors/{}",
            self.cfg.orchestrator_endpoint, self.cfg.processor_id
        );
        if let Err(e) = self.http.delete(&url).send().await {
            tracing::warn!("drain request failed: {e}");
        }

        // Bounded wait for handlers still running
        let deadline = Instant::now() + Duration::from_secs(30);
        while self.inflight.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.token.cancel();
        tracing::info!(processor_id = self.cfg.processor_id, "processor client stopped");
        Ok(())
    }

    /// Frames currently being handled
    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Cancellation handle for embedding in a larger runtime
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
