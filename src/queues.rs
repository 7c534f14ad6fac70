// Work-queue manager - owns the per-processor output streams
//
// Creation, length inspection, trimming and group bookkeeping for the
// `frames:ready:<processor_id>` streams. The registry consults
// `pel_owners` before final eviction so a processor id never disappears
// while a queue PEL still references it.

use crate::config::{dlq_name, queue_name, PROCESSOR_GROUP};
use crate::error::FlowResult;
use crate::streams::{GroupStart, Streams};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub struct WorkQueueManager {
    streams: Arc<dyn Streams>,
    default_bound: u64,
    /// Per-processor bound overrides from registration
    bounds: Mutex<HashMap<String, u64>>,
    /// Queues whose consumer group is known to exist
    ensured: Mutex<HashSet<String>>,
}

impl WorkQueueManager {
    pub fn new(streams: Arc<dyn Streams>, default_bound: u64) -> Self {
        Self {
            streams,
            default_bound,
            bounds: Mutex::new(HashMap::new()),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Create the queue stream and its consumer group if absent.
    ///
    /// The group starts at `$` so a freshly registered processor consumes
    /// only frames routed after it joined.
    pub async fn ensure_queue(&self, processor_id: &str, bound: Option<u64>) -> FlowResult<String> {
        let queue = queue_name(processor_id);

        if let Some(bound) = bound {
            self.bounds
                .lock()
                .expect("bounds lock")
                .insert(processor_id.to_string(), bound);
        }

        let already = self.ensured.lock().expect("ensured lock").contains(&queue);
        if !already {
            self.streams
                .create_group(&queue, PROCESSOR_GROUP, GroupStart::NewOnly)
                .await?;
            self.ensured.lock().expect("ensured lock").insert(queue.clone());
            tracing::debug!(processor_id, queue, "ensured work queue");
        }
        Ok(queue)
    }

    /// Effective length bound for one processor's queue
    pub fn bound(&self, processor_id: &str) -> u64 {
        self.bounds
            .lock()
            .expect("bounds lock")
            .get(processor_id)
            .copied()
            .unwrap_or(self.default_bound)
    }

    pub async fn length(&self, processor_id: &str) -> FlowResult<u64> {
        self.streams.len(&queue_name(processor_id)).await
    }

    pub async fn pending(&self, processor_id: &str) -> FlowResult<u64> {
        self.streams
            .pending_count(&queue_name(processor_id), PROCESSOR_GROUP)
            .await
    }

    pub async fn trim(&self, processor_id: &str, bound: u64) -> FlowResult<u64> {
        self.streams.trim(&queue_name(processor_id), bound).await
    }

    /// Consumer names still holding pending entries on this queue
    pub async fn pel_owners(&self, processor_id: &str) -> FlowResult<BTreeSet<String>> {
        let consumers = self
            .streams
            .pending_consumers(&queue_name(processor_id), PROCESSOR_GROUP)
            .await?;
        Ok(consumers
            .into_iter()
            .filter(|c| c.pending > 0)
            .map(|c| c.name)
            .collect())
    }

    /// Dead-letter stream name for one processor
    pub fn dlq(&self, processor_id: &str) -> String {
        dlq_name(processor_id)
    }

    /// Drop bookkeeping for an evicted processor
    pub fn forget(&self, processor_id: &str) {
        self.bounds.lock().expect("bounds lock").remove(processor_id);
        self.ensured
            .lock()
            .expect("ensured lock")
            .remove(&queue_name(processor_id));
    }
}
