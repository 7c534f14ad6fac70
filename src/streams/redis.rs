// Redis stream backend
//
// Thin mapping of the `Streams` trait onto XADD/XREADGROUP/XACK/XCLAIM and
// friends through a `ConnectionManager`, which reconnects on its own. The
// manager is a cheap clone, so each call clones it instead of serializing
// every command through one connection.

use super::{AddReply, ClaimedEntry, GroupStart, PendingConsumer, StreamEntry, Streams};
use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

pub struct RedisStreams {
    manager: ConnectionManager,
}

impl RedisStreams {
    /// Open a client and establish the managed connection.
    ///
    /// The manager retries reconnects internally; this call fails only if
    /// the endpoint is unreachable right now, which callers treat as part
    /// of their connect-retry budget.
    pub async fn connect(endpoint: &str) -> FlowResult<Self> {
        let client = redis::Client::open(endpoint).map_err(FlowError::from_redis)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(FlowError::from_redis)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Convert one delivered id's value map into owned strings
fn entry_fields(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect()
}

#[async_trait]
impl Streams for RedisStreams {
    async fn add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> FlowResult<AddReply> {
        let mut conn = self.conn();
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        match maxlen {
            Some(bound) => {
                // XADD does not report what MAXLEN evicted, so sample the
                // length first; the count is approximate under concurrency,
                // which is all the queue_full metric needs.
                let len: u64 = conn.xlen(stream).await.map_err(FlowError::from_redis)?;
                let id: String = conn
                    .xadd_maxlen(stream, StreamMaxlen::Approx(bound as usize), "*", &items)
                    .await
                    .map_err(FlowError::from_redis)?;
                Ok(AddReply {
                    id,
                    trimmed: (len + 1).saturating_sub(bound),
                })
            }
            None => {
                let id: String = conn
                    .xadd(stream, "*", &items)
                    .await
                    .map_err(FlowError::from_redis)?;
                Ok(AddReply { id, trimmed: 0 })
            }
        }
    }

    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> FlowResult<()> {
        let mut conn = self.conn();
        let start_id = match start {
            GroupStart::Beginning => "0",
            GroupStart::NewOnly => "$",
        };
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;
        match created {
            Ok(_) => Ok(()),
            // Group already exists: first use won the race, nothing to do
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(FlowError::from_redis(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> FlowResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(FlowError::from_redis)?;

        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                out.push(StreamEntry {
                    fields: entry_fields(&id.map),
                    id: id.id,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> FlowResult<()> {
        let mut conn = self.conn();
        let _acked: u64 = conn
            .xack(stream, group, &[id])
            .await
            .map_err(FlowError::from_redis)?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> FlowResult<Vec<ClaimedEntry>> {
        let mut conn = self.conn();
        let min_idle_ms = min_idle.as_millis() as u64;

        // XPENDING carries idle time and delivery count; XCLAIM then takes
        // ownership and returns the fields.
        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(FlowError::from_redis)?;

        let mut deliveries: HashMap<String, u64> = HashMap::new();
        let mut ids: Vec<String> = Vec::new();
        for p in &pending.ids {
            if p.last_delivered_ms as u64 >= min_idle_ms {
                // The claim below redelivers, so the count goes up by one
                deliveries.insert(p.id.clone(), p.times_delivered as u64 + 1);
                ids.push(p.id.clone());
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &id_refs)
            .await
            .map_err(FlowError::from_redis)?;

        let mut out = Vec::new();
        for id in reply.ids {
            let count = deliveries.get(&id.id).copied().unwrap_or(1);
            out.push(ClaimedEntry {
                entry: StreamEntry {
                    fields: entry_fields(&id.map),
                    id: id.id,
                },
                deliveries: count,
            });
        }
        Ok(out)
    }

    async fn len(&self, stream: &str) -> FlowResult<u64> {
        let mut conn = self.conn();
        conn.xlen(stream).await.map_err(FlowError::from_redis)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> FlowResult<u64> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .await
            .map_err(FlowError::from_redis)?;
        Ok(reply.count() as u64)
    }

    async fn pending_consumers(
        &self,
        stream: &str,
        group: &str,
    ) -> FlowResult<Vec<PendingConsumer>> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .await
            .map_err(FlowError::from_redis)?;

        match reply {
            StreamPendingReply::Empty => Ok(Vec::new()),
            StreamPendingReply::Data(data) => Ok(data
                .consumers
                .into_iter()
                .map(|c| PendingConsumer {
                    name: c.name,
                    pending: c.pending as u64,
                })
                .collect()),
        }
    }

    async fn trim(&self, stream: &str, maxlen: u64) -> FlowResult<u64> {
        let mut conn = self.conn();
        let removed: u64 = conn
            .xtrim(stream, StreamMaxlen::Equals(maxlen as usize))
            .await
            .map_err(FlowError::from_redis)?;
        Ok(removed)
    }

    async fn ping(&self) -> FlowResult<()> {
        let mut conn = self.conn();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(FlowError::from_redis)?;
        Ok(())
    }
}
