// Trace context codec - W3C trace propagation headers carried through streams
//
// Every frame carries a mapping of lower-cased propagation headers
// (`traceparent`, `tracestate`, baggage). The orchestrator extracts the
// context from the ingest entry, derives a child span for the routing hop,
// and injects the child into every work-queue write. Processors repeat the
// exercise for the handler hop, so spans from ingest, routing, queue-read
// and handler all share one trace id.
//
// Unknown header keys are preserved verbatim: this map is a pass-through
// surface, not a schema.

use crate::error::{FlowError, FlowResult};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical header carrying trace id, parent span id and flags
pub const TRACEPARENT: &str = "traceparent";
/// Vendor-specific trace state, forwarded untouched
pub const TRACESTATE: &str = "tracestate";

/// Propagation headers for one frame, keys lower-cased
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    headers: BTreeMap<String, String>,
}

impl TraceContext {
    /// Context with no headers; a child derived from it starts a new trace
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from an arbitrary header map, lower-casing keys
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        Self { headers }
    }

    /// Decode the JSON object stored in the stream's `trace_context` field
    pub fn from_json(raw: &str) -> FlowResult<Self> {
        if raw.is_empty() {
            return Ok(Self::empty());
        }
        let map: BTreeMap<String, String> = serde_json::from_str(raw)
            .map_err(|e| FlowError::Validation(format!("trace_context is not a JSON object of strings: {e}")))?;
        Ok(Self::from_headers(map))
    }

    /// Encode back to the JSON object form used on the wire
    pub fn to_json(&self) -> String {
        // BTreeMap of strings cannot fail to serialize
        serde_json::to_string(&self.headers).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_ascii_lowercase(), value);
    }

    /// Parsed `traceparent`, if present and well-formed
    pub fn traceparent(&self) -> Option<Traceparent> {
        self.get(TRACEPARENT).and_then(Traceparent::parse)
    }

    /// Trace id shared by every span in this trace (hex, 32 chars)
    pub fn trace_id(&self) -> Option<String> {
        self.traceparent().map(|tp| tp.trace_id)
    }

    /// Derive the context for the next hop.
    ///
    /// Keeps the trace id and flags, replaces the parent span id with a
    /// fresh one. A context without a valid `traceparent` starts a new
    /// trace so downstream hops still correlate with each other.
    pub fn child(&self) -> Self {
        let parent = self.traceparent();
        let next = match parent {
            Some(tp) => Traceparent {
                trace_id: tp.trace_id,
                span_id: random_hex(8),
                flags: tp.flags,
            },
            None => Traceparent::new_root(),
        };

        let mut headers = self.headers.clone();
        headers.insert(TRACEPARENT.to_string(), next.to_string());
        Self { headers }
    }
}

/// Decoded `traceparent` header: `00-<trace_id>-<span_id>-<flags>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceparent {
    /// 16 bytes, lower-case hex (32 chars)
    pub trace_id: String,
    /// 8 bytes, lower-case hex (16 chars)
    pub span_id: String,
    /// Sampling flags byte
    pub flags: u8,
}

impl Traceparent {
    /// Start a new trace with a sampled root span
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            flags: 0x01,
        }
    }

    /// Parse the version-00 wire form; returns None on any malformation.
    ///
    /// All-zero trace or span ids are invalid per the W3C spec and are
    /// rejected so a broken upstream cannot collapse every frame onto the
    /// null trace.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || trace_id.bytes().all(|b| b == b'0') {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags,
        })
    }
}

impl fmt::Display for Traceparent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `n` random bytes as lower-case hex
fn random_hex(n: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut out = String::with_capacity(n * 2);
    for _ in 0..n {
        let byte: u8 = rng.random();
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_traceparent() {
        let tp = Traceparent::parse("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
            .expect("should parse");
        assert_eq!(tp.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(tp.span_id, "b7ad6b7169203331");
        assert_eq!(tp.flags, 1);
    }

    #[test]
    fn reject_malformed_traceparent() {
        assert!(Traceparent::parse("").is_none());
        assert!(Traceparent::parse("01-abc-def-01").is_none());
        // all-zero trace id
        assert!(Traceparent::parse(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
        // upper-case hex is not valid on the wire
        assert!(Traceparent::parse(
            "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01"
        )
        .is_none());
    }

    #[test]
    fn child_keeps_trace_id_and_rotates_span() {
        let ctx = TraceContext::from_headers([(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )]);
        let child = ctx.child();
        assert_eq!(child.trace_id().as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert_ne!(
            child.traceparent().unwrap().span_id,
            ctx.traceparent().unwrap().span_id
        );
    }

    #[test]
    fn child_of_empty_starts_new_trace() {
        let child = TraceContext::empty().child();
        let tp = child.traceparent().expect("child must carry traceparent");
        assert_eq!(tp.trace_id.len(), 32);
        assert_eq!(tp.span_id.len(), 16);
    }

    #[test]
    fn unknown_headers_survive_child_derivation() {
        let mut ctx = TraceContext::empty();
        ctx.insert("baggage", "tenant=cam-lab".to_string());
        ctx.insert("X-Custom", "kept".to_string());
        let child = ctx.child();
        assert_eq!(child.get("baggage"), Some("tenant=cam-lab"));
        assert_eq!(child.get("x-custom"), Some("kept"));
    }

    #[test]
    fn json_round_trip() {
        let ctx = TraceContext::from_headers([
            ("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
            ("tracestate", "vendor=x"),
        ]);
        let back = TraceContext::from_json(&ctx.to_json()).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn bad_json_is_a_validation_error() {
        assert!(matches!(
            TraceContext::from_json("not json"),
            Err(FlowError::Validation(_))
        ));
    }
}
