// Frame events - the metadata records that flow through the pipeline
//
// A frame event describes one captured video frame: identity, capture time,
// descriptive dimensions, an opaque reference to the pixel payload and two
// JSON sub-documents (trace context, free-form metadata). On the stream the
// event is a flat map of byte-string fields; the JSON sub-documents travel
// as raw JSON strings so unknown keys survive the hop untouched.

use crate::error::{FlowError, FlowResult};
use crate::tracectx::TraceContext;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Allowance for ingest-agent clocks running ahead of ours
pub const CLOCK_SKEW_ALLOWANCE_SECS: i64 = 5;

/// Recognized metadata key: comma-separated required capabilities
pub const META_DETECTION_HINT: &str = "detection_hint";
/// Recognized metadata key: admission priority 0..9
pub const META_PRIORITY: &str = "priority";
/// Default priority when the metadata carries none
pub const DEFAULT_PRIORITY: u8 = 5;

// Stream field names (wire contract with the ingest agent)
pub const F_FRAME_ID: &str = "frame_id";
pub const F_CAMERA_ID: &str = "camera_id";
pub const F_TIMESTAMP: &str = "timestamp";
pub const F_SIZE_BYTES: &str = "size_bytes";
pub const F_WIDTH: &str = "width";
pub const F_HEIGHT: &str = "height";
pub const F_FORMAT: &str = "format";
pub const F_CONTENT_REF: &str = "content_ref";
pub const F_TRACE_CONTEXT: &str = "trace_context";
pub const F_METADATA: &str = "metadata";
pub const F_FAILURE_REASON: &str = "failure_reason";

/// One captured frame's metadata, as consumed from the ingest stream
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
    /// Globally unique: `<timestamp>_<camera_id>_<sequence>`
    pub frame_id: String,
    pub camera_id: String,
    /// UTC capture instant, monotonic within one camera
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Opaque reference to the pixel payload in external storage
    pub content_ref: Option<String>,
    /// Propagation headers; replaced with a child context on every hop
    pub trace_context: TraceContext,
    /// Free-form metadata blob, unknown keys preserved
    pub metadata: Map<String, Value>,
}

impl FrameEvent {
    /// Capabilities this frame requires, drawn from `metadata.detection_hint`.
    ///
    /// An absent or empty hint yields the empty set, which the router
    /// treats as "broadcast" (configurable).
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        self.metadata
            .get(META_DETECTION_HINT)
            .and_then(Value::as_str)
            .map(|hint| {
                hint.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Admission priority, clamped to 0..9, defaulting to 5
    pub fn priority(&self) -> u8 {
        self.metadata
            .get(META_PRIORITY)
            .and_then(Value::as_u64)
            .map(|p| p.min(9) as u8)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// Encode to the flat field list appended to a stream entry
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (F_FRAME_ID.to_string(), self.frame_id.clone()),
            (F_CAMERA_ID.to_string(), self.camera_id.clone()),
            (
                F_TIMESTAMP.to_string(),
                self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (F_SIZE_BYTES.to_string(), self.size_bytes.to_string()),
            (F_WIDTH.to_string(), self.width.to_string()),
            (F_HEIGHT.to_string(), self.height.to_string()),
            (F_FORMAT.to_string(), self.format.clone()),
            (F_TRACE_CONTEXT.to_string(), self.trace_context.to_json()),
            (
                F_METADATA.to_string(),
                serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string()),
            ),
        ];
        if let Some(content_ref) = &self.content_ref {
            fields.push((F_CONTENT_REF.to_string(), content_ref.clone()));
        }
        fields
    }

    /// Decode from the field map of one stream entry.
    ///
    /// Any missing required field or malformed value is a `Validation`
    /// error; the consumer dead-letters such entries instead of crashing.
    pub fn from_fields(fields: &HashMap<String, String>) -> FlowResult<Self> {
        let required = |name: &str| -> FlowResult<&String> {
            fields
                .get(name)
                .ok_or_else(|| FlowError::Validation(format!("missing field '{name}'")))
        };

        let frame_id = required(F_FRAME_ID)?.clone();
        if frame_id.is_empty() {
            return Err(FlowError::Validation("empty frame_id".to_string()));
        }
        let camera_id = required(F_CAMERA_ID)?.clone();
        if camera_id.is_empty() {
            return Err(FlowError::Validation("empty camera_id".to_string()));
        }

        let raw_ts = required(F_TIMESTAMP)?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|e| FlowError::Validation(format!("bad timestamp '{raw_ts}': {e}")))?
            .with_timezone(&Utc);

        let parse_num = |name: &str| -> FlowResult<u64> {
            match fields.get(name) {
                None => Ok(0),
                Some(raw) => raw
                    .parse()
                    .map_err(|_| FlowError::Validation(format!("bad numeric field '{name}': '{raw}'"))),
            }
        };

        let size_bytes = parse_num(F_SIZE_BYTES)?;
        let width = parse_num(F_WIDTH)? as u32;
        let height = parse_num(F_HEIGHT)? as u32;

        let trace_context = match fields.get(F_TRACE_CONTEXT) {
            Some(raw) => TraceContext::from_json(raw)?,
            None => TraceContext::empty(),
        };

        let metadata = match fields.get(F_METADATA) {
            Some(raw) if !raw.is_empty() => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(FlowError::Validation(format!(
                        "metadata must be a JSON object, got {other}"
                    )))
                }
                Err(e) => return Err(FlowError::Validation(format!("bad metadata JSON: {e}"))),
            },
            _ => Map::new(),
        };

        Ok(Self {
            frame_id,
            camera_id,
            timestamp,
            size_bytes,
            width,
            height,
            format: fields.get(F_FORMAT).cloned().unwrap_or_default(),
            content_ref: fields.get(F_CONTENT_REF).cloned(),
            trace_context,
            metadata,
        })
    }

    /// Sanity checks beyond field-level decoding.
    ///
    /// `timestamp` may not run ahead of `now` by more than the clock-skew
    /// allowance.
    pub fn validate(&self, now: DateTime<Utc>) -> FlowResult<()> {
        let horizon = now + ChronoDuration::seconds(CLOCK_SKEW_ALLOWANCE_SECS);
        if self.timestamp > horizon {
            return Err(FlowError::Validation(format!(
                "frame {} timestamp {} is in the future (now {})",
                self.frame_id, self.timestamp, now
            )));
        }
        Ok(())
    }

    /// Copy of this frame with the trace context replaced by `ctx`.
    ///
    /// Used by the router when injecting the routing hop's child context
    /// into work-queue writes.
    pub fn with_trace_context(&self, ctx: TraceContext) -> Self {
        let mut copy = self.clone();
        copy.trace_context = ctx;
        copy
    }
}

/// Result record a processor appends to the downstream stream
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub frame_id: String,
    pub processor_id: String,
    pub result: Value,
    /// Inherited from the consumed frame so the trace stays continuous
    pub trace_context: TraceContext,
}

impl ProcessedFrame {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (F_FRAME_ID.to_string(), self.frame_id.clone()),
            ("processor_id".to_string(), self.processor_id.clone()),
            ("result".to_string(), self.result.to_string()),
            (F_TRACE_CONTEXT.to_string(), self.trace_context.to_json()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_frame() -> FrameEvent {
        let mut metadata = Map::new();
        metadata.insert(META_DETECTION_HINT.to_string(), json!("face,object"));
        metadata.insert(META_PRIORITY.to_string(), json!(7));
        metadata.insert("vendor_extra".to_string(), json!({"lens": "wide"}));

        FrameEvent {
            frame_id: "1735689600000_cam01_42".to_string(),
            camera_id: "cam01".to_string(),
            timestamp: Utc::now(),
            size_bytes: 184_320,
            width: 640,
            height: 480,
            format: "jpeg".to_string(),
            content_ref: Some("s3://frames/cam01/42.jpg".to_string()),
            trace_context: TraceContext::empty().child(),
            metadata,
        }
    }

    #[test]
    fn field_round_trip_preserves_everything() {
        let frame = sample_frame();
        let fields: HashMap<String, String> = frame.to_fields().into_iter().collect();
        let decoded = FrameEvent::from_fields(&fields).expect("round trip");

        assert_eq!(decoded.frame_id, frame.frame_id);
        assert_eq!(decoded.camera_id, frame.camera_id);
        assert_eq!(decoded.size_bytes, frame.size_bytes);
        assert_eq!(decoded.width, frame.width);
        assert_eq!(decoded.height, frame.height);
        assert_eq!(decoded.format, frame.format);
        assert_eq!(decoded.content_ref, frame.content_ref);
        assert_eq!(decoded.trace_context, frame.trace_context);
        // Unknown metadata keys must survive bit-for-bit
        assert_eq!(decoded.metadata.get("vendor_extra"), frame.metadata.get("vendor_extra"));
        // Millisecond precision on the wire
        assert_eq!(
            decoded.timestamp.timestamp_millis(),
            frame.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn capabilities_from_detection_hint() {
        let frame = sample_frame();
        let caps = frame.required_capabilities();
        assert!(caps.contains("face"));
        assert!(caps.contains("object"));
        assert_eq!(caps.len(), 2);
    }

    #[test]
    fn empty_hint_means_empty_predicate() {
        let mut frame = sample_frame();
        frame.metadata.remove(META_DETECTION_HINT);
        assert!(frame.required_capabilities().is_empty());
    }

    #[test]
    fn priority_defaults_and_clamps() {
        let mut frame = sample_frame();
        assert_eq!(frame.priority(), 7);
        frame.metadata.remove(META_PRIORITY);
        assert_eq!(frame.priority(), DEFAULT_PRIORITY);
        frame.metadata.insert(META_PRIORITY.to_string(), json!(99));
        assert_eq!(frame.priority(), 9);
    }

    #[test]
    fn missing_frame_id_is_validation_error() {
        let frame = sample_frame();
        let mut fields: HashMap<String, String> = frame.to_fields().into_iter().collect();
        fields.remove(F_FRAME_ID);
        assert!(matches!(
            FrameEvent::from_fields(&fields),
            Err(FlowError::Validation(_))
        ));
    }

    #[test]
    fn future_timestamp_fails_validation() {
        let mut frame = sample_frame();
        frame.timestamp = Utc::now() + ChronoDuration::seconds(120);
        assert!(frame.validate(Utc::now()).is_err());
        frame.timestamp = Utc::now();
        assert!(frame.validate(Utc::now()).is_ok());
    }

    #[test]
    fn garbage_metadata_is_rejected_not_panicked() {
        let frame = sample_frame();
        let mut fields: HashMap<String, String> = frame.to_fields().into_iter().collect();
        fields.insert(F_METADATA.to_string(), "[1,2,3]".to_string());
        assert!(matches!(
            FrameEvent::from_fields(&fields),
            Err(FlowError::Validation(_))
        ));
    }
}
