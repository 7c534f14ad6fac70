// In-memory stream backend
//
// Mirrors the consumer-group semantics the pipeline relies on: broker-style
// `<ms>-<seq>` entry ids, per-group last-delivered cursors, a pending list
// with per-entry delivery counts, idle-based claims and length-bound
// trimming. Used by the test suite and by demo mode; production uses the
// Redis backend.

use super::{AddReply, ClaimedEntry, GroupStart, PendingConsumer, StreamEntry, Streams};
use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

type IdKey = (u64, u64);

#[derive(Debug)]
struct MemEntry {
    key: IdKey,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct MemGroup {
    last_delivered: IdKey,
    pending: BTreeMap<IdKey, PendingState>,
}

#[derive(Debug, Default)]
struct MemStream {
    entries: VecDeque<MemEntry>,
    last_id: IdKey,
    groups: HashMap<String, MemGroup>,
}

impl MemStream {
    fn next_key(&mut self) -> IdKey {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let key = if ms > self.last_id.0 {
            (ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = key;
        key
    }
}

/// Broker-free backend with Redis-stream semantics
#[derive(Default)]
pub struct MemoryStreams {
    inner: Mutex<HashMap<String, MemStream>>,
}

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }
}

fn format_id(key: IdKey) -> String {
    format!("{}-{}", key.0, key.1)
}

fn parse_id(id: &str) -> FlowResult<IdKey> {
    let (ms, seq) = id
        .split_once('-')
        .ok_or_else(|| FlowError::Validation(format!("bad entry id '{id}'")))?;
    let ms = ms
        .parse()
        .map_err(|_| FlowError::Validation(format!("bad entry id '{id}'")))?;
    let seq = seq
        .parse()
        .map_err(|_| FlowError::Validation(format!("bad entry id '{id}'")))?;
    Ok((ms, seq))
}

fn no_group(stream: &str, group: &str) -> FlowError {
    FlowError::PermanentTransport(format!("no such consumer group '{group}' on stream '{stream}'"))
}

#[async_trait]
impl Streams for MemoryStreams {
    async fn add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: Option<u64>,
    ) -> FlowResult<AddReply> {
        let mut inner = self.inner.lock().expect("streams lock");
        let st = inner.entry(stream.to_string()).or_default();

        let key = st.next_key();
        st.entries.push_back(MemEntry {
            key,
            fields: fields.iter().cloned().collect(),
        });

        let mut trimmed = 0;
        if let Some(bound) = maxlen {
            while st.entries.len() as u64 > bound {
                st.entries.pop_front();
                trimmed += 1;
            }
        }

        Ok(AddReply {
            id: format_id(key),
            trimmed,
        })
    }

    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> FlowResult<()> {
        let mut inner = self.inner.lock().expect("streams lock");
        let st = inner.entry(stream.to_string()).or_default();

        // Existing group: ignore, matching BUSYGROUP handling on the broker
        if st.groups.contains_key(group) {
            return Ok(());
        }

        let last_delivered = match start {
            GroupStart::Beginning => (0, 0),
            GroupStart::NewOnly => st.last_id,
        };
        st.groups.insert(
            group.to_string(),
            MemGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> FlowResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;

        loop {
            {
                let mut inner = self.inner.lock().expect("streams lock");
                let st = inner
                    .get_mut(stream)
                    .ok_or_else(|| no_group(stream, group))?;

                let grp = st
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| no_group(stream, group))?;
                let cursor = grp.last_delivered;

                let batch: Vec<(IdKey, HashMap<String, String>)> = st
                    .entries
                    .iter()
                    .filter(|e| e.key > cursor)
                    .take(count)
                    .map(|e| (e.key, e.fields.clone()))
                    .collect();

                if !batch.is_empty() {
                    let grp = st.groups.get_mut(group).expect("group just checked");
                    let now = Instant::now();
                    let mut out = Vec::with_capacity(batch.len());
                    for (key, fields) in batch {
                        grp.last_delivered = grp.last_delivered.max(key);
                        grp.pending.insert(
                            key,
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                deliveries: 1,
                            },
                        );
                        out.push(StreamEntry {
                            id: format_id(key),
                            fields,
                        });
                    }
                    return Ok(out);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> FlowResult<()> {
        let key = parse_id(id)?;
        let mut inner = self.inner.lock().expect("streams lock");
        if let Some(st) = inner.get_mut(stream) {
            if let Some(grp) = st.groups.get_mut(group) {
                grp.pending.remove(&key);
            }
        }
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
        let mut inner = self.inner.lock().expect("streams lock");
        let Some(st) = inner.get_mut(stream) else {
            return Ok(Vec::new());
        };

        // Index entries by key so claimed ids resolve to fields
        let by_key: HashMap<IdKey, HashMap<String, String>> = st
            .entries
            .iter()
            .map(|e| (e.key, e.fields.clone()))
            .collect();

        let Some(grp) = st.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let idle_keys: Vec<IdKey> = grp
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(k, _)| *k)
            .take(count)
            .collect();

        let mut claimed = Vec::new();
        for key in idle_keys {
            match by_key.get(&key) {
                Some(fields) => {
                    let p = grp.pending.get_mut(&key).expect("pending key just listed");
                    p.consumer = consumer.to_string();
                    p.delivered_at = now;
                    p.deliveries += 1;
                    claimed.push(ClaimedEntry {
                        entry: StreamEntry {
                            id: format_id(key),
                            fields: fields.clone(),
                        },
                        deliveries: p.deliveries,
                    });
                }
                None => {
                    // Entry trimmed out from under the PEL; drop the
                    // reference like the broker does on claim
                    grp.pending.remove(&key);
                }
            }
        }
        Ok(claimed)
    }

    async fn len(&self, stream: &str) -> FlowResult<u64> {
        let inner = self.inner.lock().expect("streams lock");
        Ok(inner.get(stream).map_or(0, |s| s.entries.len() as u64))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> FlowResult<u64> {
        let inner = self.inner.lock().expect("streams lock");
        Ok(inner
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len() as u64))
    }

    async fn pending_consumers(
        &self,
        stream: &str,
        group: &str,
    ) -> FlowResult<Vec<PendingConsumer>> {
        let inner = self.inner.lock().expect("streams lock");
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        if let Some(grp) = inner.get(stream).and_then(|s| s.groups.get(group)) {
            for p in grp.pending.values() {
                *totals.entry(p.consumer.clone()).or_default() += 1;
            }
        }
        Ok(totals
            .into_iter()
            .map(|(name, pending)| PendingConsumer { name, pending })
            .collect())
    }

    async fn trim(&self, stream: &str, maxlen: u64) -> FlowResult<u64> {
        let mut inner = self.inner.lock().expect("streams lock");
        let Some(st) = inner.get_mut(stream) else {
            return Ok(0);
        };
        let mut trimmed = 0;
        while st.entries.len() as u64 > maxlen {
            st.entries.pop_front();
            trimmed += 1;
        }
        Ok(trimmed)
    }

    async fn ping(&self) -> FlowResult<()> {
        Ok(())
    }
}
