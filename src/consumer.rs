// Stream consumer - reads the ingest stream as a consumer-group member
//
// One long-lived reader: claims work abandoned by crashed peers, reads new
// entries with `>`, decodes them into frame events and hands them to the
// router workers over a bounded channel. Entries are acknowledged by the
// router only after every target queue accepted the write; malformed
// entries are dead-lettered and acked here so a poison entry cannot stall
// the group.

use crate::backpressure::BackpressureController;
use crate::config::{ConsumerConfig, MALFORMED_DLQ};
use crate::error::{Backoff, FlowError, FlowResult};
use crate::frame::{FrameEvent, F_FAILURE_REASON};
use crate::streams::{GroupStart, StreamEntry, Streams};
use crate::telemetry;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connection attempts before startup gives up with a ConfigError
const CONNECT_RETRY_BUDGET: u32 = 5;

/// One decoded ingest entry on its way to the router
#[derive(Debug)]
pub struct IngestItem {
    pub entry_id: String,
    pub frame: FrameEvent,
}

pub struct StreamConsumer {
    streams: Arc<dyn Streams>,
    stream: String,
    group: String,
    consumer_id: String,
    cfg: ConsumerConfig,
    running: AtomicBool,
    connected: AtomicBool,
}

impl StreamConsumer {
    pub fn new(
        streams: Arc<dyn Streams>,
        stream: String,
        group: String,
        consumer_id: String,
        cfg: ConsumerConfig,
    ) -> Self {
        Self {
            streams,
            stream,
            group,
            consumer_id,
            cfg,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }
    }

    /// Reachability + group creation, spending the connect-retry budget.
    ///
    /// An endpoint that stays unreachable is a `ConfigError`: the process
    /// exits 1 rather than spinning on a broker that was never there.
    pub async fn start(&self) -> FlowResult<()> {
        let mut backoff = Backoff::new();
        let mut last_err = String::new();

        for attempt in 1..=CONNECT_RETRY_BUDGET {
            match self.streams.ping().await {
                Ok(()) => {
                    self.streams
                        .create_group(&self.stream, &self.group, GroupStart::Beginning)
                        .await?;
                    self.connected.store(true, Ordering::Relaxed);
                    tracing::info!(
                        stream = self.stream,
                        group = self.group,
                        consumer = self.consumer_id,
                        "ingest consumer ready"
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!(attempt, "ingest stream unreachable: {last_err}");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }

        Err(FlowError::Config(format!(
            "ingest stream unreachable after {CONNECT_RETRY_BUDGET} attempts: {last_err}"
        )))
    }

    /// One read pass: reclaim abandoned entries first, then new ones.
    ///
    /// Reclaimed entries redeliver work whose previous owner crashed or
    /// never acked; they are indistinguishable from fresh entries to the
    /// router, which is exactly the at-least-once contract.
    pub async fn next_batch(&self) -> FlowResult<Vec<StreamEntry>> {
        let mut batch: Vec<StreamEntry> = self
            .streams
            .claim_idle(
                &self.stream,
                &self.group,
                &self.consumer_id,
                self.cfg.pel_reclaim,
                self.cfg.batch_size,
            )
            .await?
            .into_iter()
            .map(|c| c.entry)
            .collect();

        if batch.len() < self.cfg.batch_size {
            let fresh = self
                .streams
                .read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer_id,
                    self.cfg.batch_size - batch.len(),
                    self.cfg.block,
                )
                .await?;
            batch.extend(fresh);
        }
        Ok(batch)
    }

    /// Mark one ingest entry complete in the group PEL
    pub async fn ack(&self, entry_id: &str) -> FlowResult<()> {
        self.streams.ack(&self.stream, &self.group, entry_id).await
    }

    /// True while the read loop is alive (feeds /health)
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// True once the ingest connection came up (feeds /ready)
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Long-running read loop: decode, dead-letter malformed entries, and
    /// push the rest to the router workers. Transient transport errors
    /// back off and continue; permanent ones escalate to the supervisor.
    pub async fn run(
        &self,
        tx: mpsc::Sender<IngestItem>,
        backpressure: Arc<BackpressureController>,
        token: CancellationToken,
    ) -> FlowResult<()> {
        self.running.store(true, Ordering::Relaxed);
        let mut backoff = Backoff::new();

        let result = 'read: loop {
            if token.is_cancelled() {
                break Ok(());
            }

            // PEL pressure: stop taking on new work until the sampler
            // observes the backlog shrinking
            if backpressure.admission_paused() {
                tokio::select! {
                    _ = token.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(self.cfg.block) => continue,
                }
            }

            let batch = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                batch = self.next_batch() => batch,
            };

            let batch = match batch {
                Ok(batch) => {
                    self.connected.store(true, Ordering::Relaxed);
                    backoff.reset();
                    batch
                }
                Err(e) if e.is_transient() => {
                    self.connected.store(false, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    tracing::warn!("ingest read failed, retrying in {delay:?}: {e}");
                    tokio::select! {
                        _ = token.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => break Err(e),
            };

            for entry in batch {
                metrics::counter!(telemetry::FRAMES_INGESTED).increment(1);

                let frame = match FrameEvent::from_fields(&entry.fields) {
                    Ok(frame) => match frame.validate(Utc::now()) {
                        Ok(()) => frame,
                        Err(e) => {
                            self.dead_letter(&entry, &e).await;
                            continue;
                        }
                    },
                    Err(e) => {
                        self.dead_letter(&entry, &e).await;
                        continue;
                    }
                };

                let item = IngestItem {
                    entry_id: entry.id,
                    frame,
                };
                tokio::select! {
                    _ = token.cancelled() => break 'read Ok(()),
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            // Router workers are gone; shutdown is underway
                            break 'read Ok(());
                        }
                    }
                }
            }
        };

        self.running.store(false, Ordering::Relaxed);
        result
    }

    /// Park a malformed entry on the `_malformed` dead-letter stream and
    /// ack it so the group is unblocked
    async fn dead_letter(&self, entry: &StreamEntry, error: &FlowError) {
        tracing::warn!(entry_id = entry.id, "malformed ingest entry: {error}");
        metrics::counter!(telemetry::FRAMES_DROPPED, "reason" => "malformed").increment(1);
        metrics::counter!(telemetry::FRAMES_DEAD_LETTERED).increment(1);

        let mut fields: Vec<(String, String)> = entry
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push((F_FAILURE_REASON.to_string(), error.to_string()));

        if let Err(e) = self.streams.add(MALFORMED_DLQ, &fields, None).await {
            tracing::error!("failed to dead-letter malformed entry: {e}");
            // Leave it unacked; redelivery will retry the dead-letter write
            return;
        }
        if let Err(e) = self.ack(&entry.id).await {
            tracing::error!("failed to ack malformed entry: {e}");
        }
    }
}
