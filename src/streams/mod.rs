// Stream transport abstraction
//
// Everything the pipeline needs from the broker is expressed as one
// object-safe trait: append, consumer-group reads, acknowledgement, idle
// claims, pending inspection and trimming. Production runs on Redis
// streams; the test suite and demo mode run on an in-memory backend with
// the same consumer-group semantics.

mod memory;
mod redis;

pub use memory::MemoryStreams;
pub use self::redis::RedisStreams;

use crate::error::FlowResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// One entry as delivered from a stream read
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Broker-assigned id, `<ms>-<seq>`, strictly increasing per stream
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Entry taken over from another consumer's pending list
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub entry: StreamEntry,
    /// Delivery count including this claim; drives dead-letter budgets
    pub deliveries: u64,
}

/// Result of an append
#[derive(Debug, Clone)]
pub struct AddReply {
    pub id: String,
    /// Entries evicted by the length bound on this write (0 when unbounded)
    pub trimmed: u64,
}

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver the full stream history (`0`)
    Beginning,
    /// Deliver only entries appended after group creation (`$`)
    NewOnly,
}

/// Per-consumer pending summary from the group's PEL
#[derive(Debug, Clone)]
pub struct PendingConsumer {
    pub name: String,
    pub pending: u64,
}

/// Broker operations used by the orchestrator and the processor client
#[async_trait]
pub trait Streams: Send + Sync {
    /// Append an entry; with `maxlen` the stream is trimmed (approximately
    /// on Redis) to that bound, oldest first.
    async fn add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> FlowResult<AddReply>;

    /// Create a consumer group; an already-existing group is not an error.
    /// The stream is created empty if absent.
    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> FlowResult<()>;

    /// Read new entries (`>` cursor) as `consumer` in `group`, blocking up
    /// to `block` when the stream is empty. Delivered entries enter the
    /// group's pending list until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> FlowResult<Vec<StreamEntry>>;

    /// Acknowledge one delivered entry, removing it from the pending list
    async fn ack(&self, stream: &str, group: &str, id: &str) -> FlowResult<()>;

    /// Claim up to `count` entries pending longer than `min_idle` from any
    /// consumer in the group, transferring ownership to `consumer`. This
    /// is how work abandoned by a crashed peer is recovered.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> FlowResult<Vec<ClaimedEntry>>;

    /// Total entries currently in the stream
    async fn len(&self, stream: &str) -> FlowResult<u64>;

    /// Delivered-but-unacked entries across the whole group
    async fn pending_count(&self, stream: &str, group: &str) -> FlowResult<u64>;

    /// Pending totals broken down by consumer name
    async fn pending_consumers(
        &self,
        stream: &str,
        group: &str,
    ) -> FlowResult<Vec<PendingConsumer>>;

    /// Trim the stream to `maxlen`, dropping oldest entries; returns how
    /// many were removed.
    async fn trim(&self, stream: &str, maxlen: u64) -> FlowResult<u64>;

    /// Connectivity probe
    async fn ping(&self) -> FlowResult<()>;
}
