// Processor registry - authoritative in-memory catalog of live processors
//
// All mutation and lookup goes through one exclusive lock; hold times are
// bounded by pure map work (no I/O under the lock), so a match can never
// observe a descriptor mid-eviction. Eviction itself is two-phase: sweep
// nominates candidates, and the sweeper task confirms with the work-queue
// manager that no queue PEL still references the processor before calling
// `evict`.
//
// State machine:
//
//   Registering --first_heartbeat--> Active
//   Active --missed_heartbeats--> Unhealthy
//   Active --drain()--> Draining --inflight==0--> Deregistered
//   Unhealthy --heartbeat--> Active
//   Unhealthy --evict_after--> Deregistered
//   Draining --evict_after--> Deregistered
//   any      --deregister()--> Deregistered (terminal)

use crate::config::{queue_name, RegistryConfig};
use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

/// Lifecycle state of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorState {
    Registering,
    Active,
    Draining,
    Unhealthy,
    Deregistered,
}

impl ProcessorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::Registering => "Registering",
            ProcessorState::Active => "Active",
            ProcessorState::Draining => "Draining",
            ProcessorState::Unhealthy => "Unhealthy",
            ProcessorState::Deregistered => "Deregistered",
        }
    }
}

/// Registry record for one processor registration
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorDescriptor {
    pub processor_id: String,
    pub capabilities: BTreeSet<String>,
    pub queue_name: String,
    pub capacity: u32,
    pub state: ProcessorState,
    pub last_heartbeat: DateTime<Utc>,
    pub inflight: u32,
    pub consecutive_failures: u32,
}

impl ProcessorDescriptor {
    /// Load factor used for selection ordering
    pub fn load(&self) -> f64 {
        self.inflight as f64 / self.capacity.max(1) as f64
    }

    /// Saturated once inflight reaches `capacity * soft_factor`
    pub fn is_saturated(&self, soft_factor: f64) -> bool {
        self.inflight as f64 >= self.capacity as f64 * soft_factor
    }

    /// Spill may not push inflight past `capacity * hard_factor`
    pub fn has_hard_headroom(&self, hard_factor: f64) -> bool {
        (self.inflight as f64) < self.capacity as f64 * hard_factor
    }
}

/// Stats carried by a heartbeat
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatStats {
    pub inflight: u32,
    pub consecutive_failures: u32,
}

/// Descriptor payload a heartbeat may carry for self-healing registration
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub processor_id: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
}

/// Outcome of a heartbeat for an id the registry may or may not know
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Stats recorded; current state returned
    Accepted(ProcessorState),
    /// Id unknown and the heartbeat carried no descriptor to auto-register
    Unknown,
}

/// What a sweep pass found; the caller owns the follow-up I/O
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Transitioned Active -> Unhealthy this pass
    pub newly_unhealthy: Vec<String>,
    /// Unhealthy/Draining past `evict_after`; evict once their queue PELs
    /// are clear
    pub evictable: Vec<String>,
    /// Draining registrations that finished and were removed
    pub drained: Vec<String>,
}

pub struct Registry {
    cfg: RegistryConfig,
    inner: Mutex<HashMap<String, ProcessorDescriptor>>,
}

impl Registry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace a registration.
    ///
    /// Re-registering an Active processor with identical capabilities is
    /// idempotent (capacity may be updated in place). Differing
    /// capabilities on a live id are a `Conflict`.
    pub fn register(&self, req: RegistrationRequest) -> FlowResult<ProcessorDescriptor> {
        if req.processor_id.is_empty() {
            return Err(FlowError::Validation("processor_id must be non-empty".into()));
        }
        if req.capacity == 0 {
            return Err(FlowError::Validation("capacity must be >= 1".into()));
        }

        let mut inner = self.inner.lock().expect("registry lock");

        if let Some(existing) = inner.get_mut(&req.processor_id) {
            if existing.state != ProcessorState::Deregistered {
                if existing.state == ProcessorState::Active
                    && existing.capabilities != req.capabilities
                {
                    return Err(FlowError::Conflict(format!(
                        "processor '{}' is Active with capabilities {:?}",
                        req.processor_id, existing.capabilities
                    )));
                }
                if existing.state == ProcessorState::Active {
                    // Idempotent re-registration keeps the live state
                    existing.capacity = req.capacity;
                    existing.last_heartbeat = Utc::now();
                    return Ok(existing.clone());
                }
            }
        }

        if inner.len() >= self.cfg.max_processors && !inner.contains_key(&req.processor_id) {
            return Err(FlowError::Saturation(format!(
                "registry full ({} processors)",
                self.cfg.max_processors
            )));
        }

        let descriptor = ProcessorDescriptor {
            queue_name: queue_name(&req.processor_id),
            processor_id: req.processor_id.clone(),
            capabilities: req.capabilities,
            capacity: req.capacity,
            state: ProcessorState::Registering,
            last_heartbeat: Utc::now(),
            inflight: 0,
            consecutive_failures: 0,
        };
        inner.insert(req.processor_id, descriptor.clone());
        Ok(descriptor)
    }

    /// Record a heartbeat.
    ///
    /// Unknown ids auto-register when the heartbeat carries a descriptor,
    /// so a restarting processor self-heals without a separate call.
    pub fn heartbeat(
        &self,
        processor_id: &str,
        stats: HeartbeatStats,
        descriptor: Option<RegistrationRequest>,
    ) -> FlowResult<HeartbeatOutcome> {
        {
            let mut inner = self.inner.lock().expect("registry lock");
            if let Some(existing) = inner.get_mut(processor_id) {
                if existing.state != ProcessorState::Deregistered {
                    existing.last_heartbeat = Utc::now();
                    existing.inflight = stats.inflight;
                    existing.consecutive_failures = stats.consecutive_failures;
                    existing.state = match existing.state {
                        ProcessorState::Registering | ProcessorState::Unhealthy => {
                            ProcessorState::Active
                        }
                        other => other,
                    };
                    return Ok(HeartbeatOutcome::Accepted(existing.state));
                }
            }
        }

        match descriptor {
            Some(req) => {
                let mut registered = self.register(req)?;
                // First heartbeat arrives with the registration itself
                let mut inner = self.inner.lock().expect("registry lock");
                if let Some(existing) = inner.get_mut(processor_id) {
                    existing.state = ProcessorState::Active;
                    existing.inflight = stats.inflight;
                    existing.consecutive_failures = stats.consecutive_failures;
                    registered = existing.clone();
                }
                Ok(HeartbeatOutcome::Accepted(registered.state))
            }
            None => Ok(HeartbeatOutcome::Unknown),
        }
    }

    /// All Active descriptors whose capabilities satisfy `predicate`
    /// (set inclusion), ordered by the deterministic selection score:
    /// load ascending, then freshest heartbeat, then a stable id hash so
    /// equal candidates do not herd.
    pub fn match_capabilities(&self, predicate: &BTreeSet<String>) -> Vec<ProcessorDescriptor> {
        let inner = self.inner.lock().expect("registry lock");
        let mut matches: Vec<ProcessorDescriptor> = inner
            .values()
            .filter(|d| d.state == ProcessorState::Active)
            .filter(|d| predicate.iter().all(|cap| d.capabilities.contains(cap)))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            a.load()
                .partial_cmp(&b.load())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_heartbeat.cmp(&a.last_heartbeat))
                .then_with(|| stable_hash(&a.processor_id).cmp(&stable_hash(&b.processor_id)))
        });
        matches
    }

    /// Bump inflight after a successful queue write
    pub fn record_dispatch(&self, processor_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(d) = inner.get_mut(processor_id) {
            d.inflight = d.inflight.saturating_add(1);
        }
    }

    /// Count a failed queue write; returns the new consecutive_failures
    pub fn record_write_failure(&self, processor_id: &str) -> u32 {
        let mut inner = self.inner.lock().expect("registry lock");
        match inner.get_mut(processor_id) {
            Some(d) => {
                d.consecutive_failures = d.consecutive_failures.saturating_add(1);
                d.consecutive_failures
            }
            None => 0,
        }
    }

    /// Reset the failure streak after a successful write
    pub fn record_write_success(&self, processor_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(d) = inner.get_mut(processor_id) {
            d.consecutive_failures = 0;
        }
    }

    pub fn mark_unhealthy(&self, processor_id: &str, reason: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(d) = inner.get_mut(processor_id) {
            if matches!(
                d.state,
                ProcessorState::Registering | ProcessorState::Active
            ) {
                tracing::warn!(processor_id, reason, "marking processor Unhealthy");
                d.state = ProcessorState::Unhealthy;
            }
        }
    }

    /// Begin draining; completes immediately when nothing is in flight
    pub fn drain(&self, processor_id: &str) -> FlowResult<()> {
        let mut inner = self.inner.lock().expect("registry lock");
        let Some(d) = inner.get_mut(processor_id) else {
            return Err(FlowError::Validation(format!(
                "unknown processor '{processor_id}'"
            )));
        };
        if d.inflight == 0 {
            inner.remove(processor_id);
        } else {
            d.state = ProcessorState::Draining;
        }
        Ok(())
    }

    /// Terminal removal, bypassing drain
    pub fn deregister(&self, processor_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.remove(processor_id);
    }

    /// Remove a previously nominated eviction candidate. The caller must
    /// have confirmed no work-queue PEL still names this processor.
    pub fn evict(&self, processor_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        if inner.remove(processor_id).is_some() {
            tracing::info!(processor_id, "evicted processor");
        }
    }

    /// One sweep pass at `now`: silence past `unhealthy_after` demotes to
    /// Unhealthy; Unhealthy/Draining past `evict_after` become eviction
    /// candidates; finished Draining registrations are removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let unhealthy_after = ChronoDuration::from_std(self.cfg.unhealthy_after)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let evict_after = ChronoDuration::from_std(self.cfg.evict_after)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));

        let mut report = SweepReport::default();
        let mut inner = self.inner.lock().expect("registry lock");

        for d in inner.values_mut() {
            let silence = now - d.last_heartbeat;
            match d.state {
                ProcessorState::Active | ProcessorState::Registering
                    if silence > unhealthy_after =>
                {
                    d.state = ProcessorState::Unhealthy;
                    report.newly_unhealthy.push(d.processor_id.clone());
                }
                ProcessorState::Unhealthy | ProcessorState::Draining
                    if silence > evict_after =>
                {
                    report.evictable.push(d.processor_id.clone());
                }
                ProcessorState::Draining if d.inflight == 0 => {
                    report.drained.push(d.processor_id.clone());
                }
                _ => {}
            }
        }

        for id in &report.drained {
            inner.remove(id);
        }
        report
    }

    pub fn snapshot(&self) -> Vec<ProcessorDescriptor> {
        let inner = self.inner.lock().expect("registry lock");
        let mut all: Vec<_> = inner.values().cloned().collect();
        all.sort_by(|a, b| a.processor_id.cmp(&b.processor_id));
        all
    }

    pub fn get(&self, processor_id: &str) -> Option<ProcessorDescriptor> {
        let inner = self.inner.lock().expect("registry lock");
        inner.get(processor_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .values()
            .filter(|d| d.state == ProcessorState::Active)
            .count()
    }
}

fn stable_hash(id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry() -> Registry {
        Registry::new(Config::default().registry)
    }

    fn req(id: &str, caps: &[&str], capacity: u32) -> RegistrationRequest {
        RegistrationRequest {
            processor_id: id.to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            capacity,
        }
    }

    fn beat(r: &Registry, id: &str) {
        r.heartbeat(id, HeartbeatStats::default(), None).unwrap();
    }

    #[test]
    fn registration_starts_registering_then_activates() {
        let r = registry();
        let d = r.register(req("p1", &["face"], 4)).unwrap();
        assert_eq!(d.state, ProcessorState::Registering);
        assert_eq!(d.queue_name, "frames:ready:p1");

        beat(&r, "p1");
        assert_eq!(r.get("p1").unwrap().state, ProcessorState::Active);
    }

    #[test]
    fn conflicting_capabilities_are_rejected() {
        let r = registry();
        r.register(req("p1", &["object"], 4)).unwrap();
        beat(&r, "p1");

        let err = r.register(req("p1", &["face"], 4)).unwrap_err();
        assert!(matches!(err, FlowError::Conflict(_)));
        // Registry unchanged
        let d = r.get("p1").unwrap();
        assert!(d.capabilities.contains("object"));
        assert_eq!(d.state, ProcessorState::Active);
    }

    #[test]
    fn same_capabilities_reregistration_is_idempotent() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        beat(&r, "p1");

        let d = r.register(req("p1", &["face"], 8)).unwrap();
        assert_eq!(d.state, ProcessorState::Active);
        assert_eq!(d.capacity, 8);
    }

    #[test]
    fn heartbeat_with_descriptor_self_heals() {
        let r = registry();
        let outcome = r
            .heartbeat(
                "ghost",
                HeartbeatStats {
                    inflight: 2,
                    consecutive_failures: 0,
                },
                Some(req("ghost", &["ocr"], 4)),
            )
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Accepted(ProcessorState::Active));
        assert_eq!(r.get("ghost").unwrap().inflight, 2);
    }

    #[test]
    fn heartbeat_without_descriptor_for_unknown_id() {
        let r = registry();
        let outcome = r
            .heartbeat("ghost", HeartbeatStats::default(), None)
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Unknown);
    }

    #[test]
    fn match_filters_by_capability_and_state() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        r.register(req("p2", &["object"], 4)).unwrap();
        r.register(req("p3", &["face", "object"], 4)).unwrap();
        beat(&r, "p1");
        beat(&r, "p2");
        beat(&r, "p3");
        // p4 never heartbeats: still Registering, never matched
        r.register(req("p4", &["face"], 4)).unwrap();

        let predicate: BTreeSet<String> = ["face".to_string()].into();
        let ids: Vec<_> = r
            .match_capabilities(&predicate)
            .into_iter()
            .map(|d| d.processor_id)
            .collect();
        assert!(ids.contains(&"p1".to_string()));
        assert!(ids.contains(&"p3".to_string()));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn empty_predicate_matches_every_active() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        r.register(req("p2", &["object"], 4)).unwrap();
        beat(&r, "p1");
        beat(&r, "p2");

        assert_eq!(r.match_capabilities(&BTreeSet::new()).len(), 2);
    }

    #[test]
    fn selection_orders_by_load() {
        let r = registry();
        r.register(req("busy", &["face"], 4)).unwrap();
        r.register(req("idle", &["face"], 4)).unwrap();
        beat(&r, "busy");
        beat(&r, "idle");
        for _ in 0..3 {
            r.record_dispatch("busy");
        }

        let predicate: BTreeSet<String> = ["face".to_string()].into();
        let matches = r.match_capabilities(&predicate);
        assert_eq!(matches[0].processor_id, "idle");
        assert_eq!(matches[1].processor_id, "busy");
    }

    #[test]
    fn sweep_demotes_silent_processors_then_nominates_eviction() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        beat(&r, "p1");

        // Just past the silence threshold
        let later = Utc::now() + ChronoDuration::seconds(31);
        let report = r.sweep(later);
        assert_eq!(report.newly_unhealthy, vec!["p1".to_string()]);
        assert_eq!(r.get("p1").unwrap().state, ProcessorState::Unhealthy);

        // Past eviction: nominated but not removed until the caller evicts
        let much_later = Utc::now() + ChronoDuration::seconds(400);
        let report = r.sweep(much_later);
        assert_eq!(report.evictable, vec!["p1".to_string()]);
        assert!(r.get("p1").is_some());

        r.evict("p1");
        assert!(r.get("p1").is_none());
    }

    #[test]
    fn unhealthy_recovers_on_heartbeat() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        beat(&r, "p1");
        r.mark_unhealthy("p1", "test");
        assert_eq!(r.get("p1").unwrap().state, ProcessorState::Unhealthy);

        beat(&r, "p1");
        assert_eq!(r.get("p1").unwrap().state, ProcessorState::Active);
    }

    #[test]
    fn drain_with_inflight_waits_then_completes() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        beat(&r, "p1");
        r.record_dispatch("p1");

        r.drain("p1").unwrap();
        assert_eq!(r.get("p1").unwrap().state, ProcessorState::Draining);

        // Inflight drains to zero (reported via heartbeat stats); the next
        // sweep removes the registration
        {
            let mut inner = r.inner.lock().unwrap();
            inner.get_mut("p1").unwrap().inflight = 0;
        }
        let report = r.sweep(Utc::now());
        assert_eq!(report.drained, vec!["p1".to_string()]);
        assert!(r.get("p1").is_none());
    }

    #[test]
    fn drain_without_inflight_removes_immediately() {
        let r = registry();
        r.register(req("p1", &["face"], 4)).unwrap();
        r.drain("p1").unwrap();
        assert!(r.get("p1").is_none());
    }

    #[test]
    fn registry_bound_is_enforced() {
        let mut cfg = Config::default().registry;
        cfg.max_processors = 1;
        let r = Registry::new(cfg);
        r.register(req("p1", &["face"], 4)).unwrap();
        assert!(matches!(
            r.register(req("p2", &["face"], 4)),
            Err(FlowError::Saturation(_))
        ));
    }
}
