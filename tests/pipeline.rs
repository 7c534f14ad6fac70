// End-to-end pipeline tests against the in-memory stream backend
//
// These drive the real components (consumer loop, router workers,
// registry, control plane router, processor client) wired together the
// way the orchestrator wires them, and check the delivery, ack and trace
// guarantees the system documents.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{SecondsFormat, Utc};
use frameflow::backpressure::BackpressureController;
use frameflow::config::{queue_name, Config};
use frameflow::consumer::StreamConsumer;
use frameflow::control::wire::{HeartbeatBody, RegisterBody, RegisterResponse};
use frameflow::control::{app, ControlState};
use frameflow::frame::FrameEvent;
use frameflow::queues::WorkQueueManager;
use frameflow::registry::{HeartbeatStats, RegistrationRequest, Registry};
use frameflow::router::Router;
use frameflow::streams::{GroupStart, MemoryStreams, StreamEntry, Streams};
use frameflow::tracectx::TraceContext;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const INGEST: &str = "frames:metadata";
const GROUP: &str = "frame-buffer-group";

struct TestBed {
    streams: Arc<MemoryStreams>,
    registry: Arc<Registry>,
    queues: Arc<WorkQueueManager>,
    backpressure: Arc<BackpressureController>,
    consumer: Arc<StreamConsumer>,
    router: Arc<Router>,
    token: CancellationToken,
}

impl TestBed {
    fn new() -> Self {
        let mut config = Config::default();
        config.consumer.block = Duration::from_millis(10);
        config.consumer.pel_reclaim = Duration::from_millis(100);
        config.router.concurrency = 2;

        let streams = Arc::new(MemoryStreams::new());
        let registry = Arc::new(Registry::new(config.registry.clone()));
        let queues = Arc::new(WorkQueueManager::new(
            streams.clone(),
            config.router.queue_bound_default,
        ));
        let backpressure = Arc::new(BackpressureController::new(
            &config.consumer,
            config.registry.failure_threshold,
        ));
        let consumer = Arc::new(StreamConsumer::new(
            streams.clone(),
            INGEST.to_string(),
            GROUP.to_string(),
            "orch-test".to_string(),
            config.consumer.clone(),
        ));
        let router = Arc::new(Router::new(
            registry.clone(),
            queues.clone(),
            backpressure.clone(),
            streams.clone(),
            config.router.clone(),
        ));

        Self {
            streams,
            registry,
            queues,
            backpressure,
            consumer,
            router,
            token: CancellationToken::new(),
        }
    }

    /// Register a processor the way the control plane does
    async fn add_processor(&self, id: &str, caps: &[&str], capacity: u32) {
        self.registry
            .register(RegistrationRequest {
                processor_id: id.to_string(),
                capabilities: caps.iter().map(|s| s.to_string()).collect(),
                capacity,
            })
            .unwrap();
        self.registry
            .heartbeat(id, HeartbeatStats::default(), None)
            .unwrap();
        self.queues.ensure_queue(id, None).await.unwrap();
    }

    /// Start the consumer loop and two router workers
    async fn start_pipeline(&self) {
        self.consumer.start().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let rx = Arc::new(Mutex::new(rx));

        let consumer = self.consumer.clone();
        let backpressure = self.backpressure.clone();
        let token = self.token.clone();
        tokio::spawn(async move { consumer.run(tx, backpressure, token).await });

        for _ in 0..2 {
            let router = self.router.clone();
            let rx = rx.clone();
            let consumer = self.consumer.clone();
            let token = self.token.clone();
            tokio::spawn(async move { router.run_worker(rx, consumer, token).await });
        }
    }

    async fn feed(&self, frame: &FrameEvent) {
        self.streams
            .add(INGEST, &frame.to_fields(), None)
            .await
            .unwrap();
    }

    async fn ingest_pending(&self) -> u64 {
        self.streams.pending_count(INGEST, GROUP).await.unwrap()
    }

    async fn queue_len(&self, id: &str) -> u64 {
        self.streams.len(&queue_name(id)).await.unwrap()
    }

    /// Read everything currently in one queue without consuming the real
    /// processor group
    async fn peek_queue(&self, id: &str) -> Vec<StreamEntry> {
        let queue = queue_name(id);
        let group = format!("peek-{}", uuid::Uuid::new_v4().simple());
        self.streams
            .create_group(&queue, &group, GroupStart::Beginning)
            .await
            .unwrap();
        self.streams
            .read_group(&queue, &group, "peek", 1000, Duration::ZERO)
            .await
            .unwrap()
    }
}

fn frame(frame_id: &str, hint: Option<&str>, priority: Option<u8>) -> FrameEvent {
    let mut metadata = serde_json::Map::new();
    if let Some(hint) = hint {
        metadata.insert("detection_hint".to_string(), json!(hint));
    }
    if let Some(priority) = priority {
        metadata.insert("priority".to_string(), json!(priority));
    }
    FrameEvent {
        frame_id: frame_id.to_string(),
        camera_id: "c1".to_string(),
        timestamp: Utc::now(),
        size_bytes: 2048,
        width: 640,
        height: 480,
        format: "jpeg".to_string(),
        content_ref: None,
        trace_context: TraceContext::empty().child(),
        metadata,
    }
}

/// Poll `$cond` (an await-able boolean expression) until it holds or the
/// 5 s budget elapses
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if $cond {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for: {}", $what))
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_every_active_processor_and_acks() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 4).await;
    bed.add_processor("P2", &["object"], 4).await;
    bed.add_processor("P3", &["face", "object"], 4).await;
    bed.start_pipeline().await;

    bed.feed(&frame("t1_c1_1", None, None)).await;

    wait_until!(
        "broadcast delivery",
        bed.queue_len("P1").await == 1
            && bed.queue_len("P2").await == 1
            && bed.queue_len("P3").await == 1
            && bed.ingest_pending().await == 0
    );

    bed.token.cancel();
}

#[tokio::test]
async fn capability_hint_routes_to_matching_subset_only() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 4).await;
    bed.add_processor("P2", &["object"], 4).await;
    bed.add_processor("P3", &["face", "object"], 4).await;
    bed.start_pipeline().await;

    bed.feed(&frame("t2_c1_2", Some("face"), None)).await;

    wait_until!(
        "capability delivery",
        bed.queue_len("P1").await == 1
            && bed.queue_len("P3").await == 1
            && bed.ingest_pending().await == 0
    );
    assert_eq!(bed.queue_len("P2").await, 0);

    bed.token.cancel();
}

#[tokio::test]
async fn unmatched_predicate_is_dropped_and_acked() {
    let bed = TestBed::new();
    bed.add_processor("P2", &["object"], 4).await;
    bed.start_pipeline().await;

    bed.feed(&frame("t3_c1_3", Some("ocr"), None)).await;

    wait_until!(
        "no_match drop acks ingest",
        bed.ingest_pending().await == 0
    );
    assert_eq!(bed.queue_len("P2").await, 0);

    bed.token.cancel();
}

#[tokio::test]
async fn saturated_low_priority_frame_delivers_after_relief() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 2).await;
    // Saturate P1 at its soft limit
    bed.registry.record_dispatch("P1");
    bed.registry.record_dispatch("P1");
    bed.start_pipeline().await;

    bed.feed(&frame("t4_c1_4", Some("face"), Some(3))).await;

    // The frame parks in the ingest PEL while P1 is saturated
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(bed.queue_len("P1").await, 0);
    assert_eq!(bed.ingest_pending().await, 1);

    // Relief arrives via heartbeat; the reclaimed entry routes and acks
    bed.registry
        .heartbeat(
            "P1",
            HeartbeatStats {
                inflight: 0,
                consecutive_failures: 0,
            },
            None,
        )
        .unwrap();

    // Duplicates are allowed (at-least-once); delivery plus ack is the
    // contract being checked
    wait_until!(
        "delayed frame delivers after relief",
        bed.queue_len("P1").await >= 1 && bed.ingest_pending().await == 0
    );

    bed.token.cancel();
}

#[tokio::test]
async fn saturated_high_priority_frame_spills_immediately() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 2).await;
    bed.registry.record_dispatch("P1");
    bed.registry.record_dispatch("P1");
    bed.start_pipeline().await;

    bed.feed(&frame("t5_c1_5", Some("face"), Some(8))).await;

    wait_until!(
        "high-priority spill",
        bed.queue_len("P1").await == 1 && bed.ingest_pending().await == 0
    );

    bed.token.cancel();
}

#[tokio::test]
async fn malformed_ingest_entry_is_parked_not_fatal() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 4).await;
    bed.start_pipeline().await;

    // Garbage entry, then a valid frame: the garbage must not stall it
    bed.streams
        .add(INGEST, &[("junk".to_string(), "1".to_string())], None)
        .await
        .unwrap();
    bed.feed(&frame("t6_c1_6", Some("face"), None)).await;

    wait_until!(
        "valid frame delivered past poison entry",
        bed.queue_len("P1").await == 1 && bed.ingest_pending().await == 0
    );
    assert_eq!(bed.streams.len("frames:dlq:_malformed").await.unwrap(), 1);

    bed.token.cancel();
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering and boundary properties
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn per_queue_delivery_order_is_append_order() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 100).await;

    for i in 0..10 {
        let f = frame(&format!("t7_c1_{i}"), Some("face"), None);
        bed.router.route(&f).await.unwrap();
    }

    let entries = bed.peek_queue("P1").await;
    assert_eq!(entries.len(), 10);

    // Entry ids strictly increase, and the payload order matches the
    // route order
    let parse_id = |id: &str| -> (u64, u64) {
        let (ms, seq) = id.split_once('-').unwrap();
        (ms.parse().unwrap(), seq.parse().unwrap())
    };
    let mut last_id = (0, 0);
    for (i, entry) in entries.iter().enumerate() {
        let id = parse_id(&entry.id);
        assert!(id > last_id, "ids must be strictly increasing");
        last_id = id;
        assert_eq!(
            entry.fields.get("frame_id").map(String::as_str),
            Some(format!("t7_c1_{i}").as_str())
        );
    }
}

#[tokio::test]
async fn queue_at_bound_trims_oldest_on_next_write() {
    let bed = TestBed::new();
    bed.registry
        .register(RegistrationRequest {
            processor_id: "P1".to_string(),
            capabilities: ["face".to_string()].into(),
            capacity: 100,
        })
        .unwrap();
    bed.registry
        .heartbeat("P1", HeartbeatStats::default(), None)
        .unwrap();
    bed.queues.ensure_queue("P1", Some(3)).await.unwrap();

    for i in 0..4 {
        let f = frame(&format!("t8_c1_{i}"), Some("face"), None);
        bed.router.route(&f).await.unwrap();
    }

    assert_eq!(bed.queue_len("P1").await, 3);
    let entries = bed.peek_queue("P1").await;
    // Oldest (t8_c1_0) was trimmed
    assert_eq!(
        entries[0].fields.get("frame_id").map(String::as_str),
        Some("t8_c1_1")
    );
}

#[tokio::test]
async fn bounded_inflight_holds_under_spill() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 2).await;

    // Keep spilling high-priority frames; inflight must never pass
    // capacity * hard_overflow_factor (2 * 2.0 = 4)
    for i in 0..10 {
        let f = frame(&format!("t9_c1_{i}"), Some("face"), Some(9));
        bed.router.route(&f).await.unwrap();
        let inflight = bed.registry.get("P1").unwrap().inflight;
        assert!(inflight <= 4, "inflight {inflight} exceeded the hard cap");
    }
    assert_eq!(bed.queue_len("P1").await, 4);
}

// ─────────────────────────────────────────────────────────────────────────────
// Trace continuity
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn trace_id_survives_ingest_routing_queue_and_result() {
    let bed = TestBed::new();
    bed.add_processor("P1", &["face"], 4).await;
    bed.start_pipeline().await;

    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";
    let mut f = frame("t10_c1_1", Some("face"), None);
    f.trace_context = TraceContext::from_headers([(
        "traceparent",
        format!("00-{trace_id}-00f067aa0ba902b7-01"),
    )]);
    bed.feed(&f).await;

    wait_until!("frame routed", bed.queue_len("P1").await == 1);

    // Queue hop: same trace id, new span
    let entries = bed.peek_queue("P1").await;
    let queue_ctx =
        TraceContext::from_json(entries[0].fields.get("trace_context").unwrap()).unwrap();
    assert_eq!(queue_ctx.trace_id().as_deref(), Some(trace_id));
    assert_ne!(
        queue_ctx.traceparent().unwrap().span_id,
        "00f067aa0ba902b7"
    );

    // Handler + result hop through the processor client
    let mut client_cfg = frameflow::ClientConfig::new(
        "http://127.0.0.1:1",
        "redis://unused",
        "P1",
        ["face".to_string()],
        4,
    );
    client_cfg.block = Duration::from_millis(10);
    let client = frameflow::ProcessorClient::with_streams(client_cfg, bed.streams.clone());
    let client_token = client.cancellation_token();
    let consume = tokio::spawn(async move {
        client
            .consume(|frame| async move { Ok(Some(json!({"frame": frame.frame_id}))) })
            .await
    });

    wait_until!(
        "result emitted",
        bed.streams.len("frames:processed").await.unwrap() == 1
    );

    let group = "inspect-results";
    bed.streams
        .create_group("frames:processed", group, GroupStart::Beginning)
        .await
        .unwrap();
    let results = bed
        .streams
        .read_group("frames:processed", group, "t", 10, Duration::ZERO)
        .await
        .unwrap();
    let result_ctx =
        TraceContext::from_json(results[0].fields.get("trace_context").unwrap()).unwrap();
    assert_eq!(result_ctx.trace_id().as_deref(), Some(trace_id));

    client_token.cancel();
    consume.await.unwrap().unwrap();
    bed.token.cancel();
}

// ─────────────────────────────────────────────────────────────────────────────
// Control plane
// ─────────────────────────────────────────────────────────────────────────────

fn control_state(bed: &TestBed) -> ControlState {
    ControlState {
        registry: bed.registry.clone(),
        queues: bed.queues.clone(),
        backpressure: bed.backpressure.clone(),
        consumer: bed.consumer.clone(),
        metrics: metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder().handle(),
    }
}

async fn post_json(router: &axum::Router, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn register_heartbeat_snapshot_round_trip() {
    let bed = TestBed::new();
    let router = app(control_state(&bed));

    let (status, body) = post_json(
        &router,
        "/processors",
        json!({"processor_id": "P1", "capabilities": ["face"], "capacity": 4}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: RegisterResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.queue_name, "frames:ready:P1");

    let (status, _) = post_json(
        &router,
        "/processors/P1/heartbeat",
        serde_json::to_value(HeartbeatBody {
            inflight: 3,
            consecutive_failures: 1,
            descriptor: None,
        })
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Snapshot reports the heartbeat's stats
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/processors").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let snapshot: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let processor = &snapshot["processors"][0];
    assert_eq!(processor["processor_id"], "P1");
    assert_eq!(processor["inflight"], 3);
    assert_eq!(processor["consecutive_failures"], 1);
    assert_eq!(processor["state"], "Active");
}

#[tokio::test]
async fn duplicate_registration_with_different_capabilities_is_409() {
    let bed = TestBed::new();
    let router = app(control_state(&bed));

    post_json(
        &router,
        "/processors",
        json!({"processor_id": "P1", "capabilities": ["object"], "capacity": 4}),
    )
    .await;
    post_json(
        &router,
        "/processors/P1/heartbeat",
        json!({"inflight": 0, "consecutive_failures": 0}),
    )
    .await;

    let (status, _) = post_json(
        &router,
        "/processors",
        json!({"processor_id": "P1", "capabilities": ["face"], "capacity": 4}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Registry unchanged
    let d = bed.registry.get("P1").unwrap();
    assert!(d.capabilities.contains("object"));
}

#[tokio::test]
async fn heartbeat_with_descriptor_auto_registers_unknown_id() {
    let bed = TestBed::new();
    let router = app(control_state(&bed));

    let body = serde_json::to_value(HeartbeatBody {
        inflight: 0,
        consecutive_failures: 0,
        descriptor: Some(RegisterBody {
            processor_id: "ghost".to_string(),
            capabilities: vec!["ocr".to_string()],
            capacity: 2,
            queue_bound: None,
        }),
    })
    .unwrap();

    let (status, _) = post_json(&router, "/processors/ghost/heartbeat", body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(bed.registry.get("ghost").is_some());

    // Without a descriptor an unknown id is a 404
    let (status, _) = post_json(
        &router,
        "/processors/phantom/heartbeat",
        json!({"inflight": 0, "consecutive_failures": 0}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deregister_drains_and_unknown_is_404() {
    let bed = TestBed::new();
    let router = app(control_state(&bed));

    post_json(
        &router,
        "/processors",
        json!({"processor_id": "P1", "capabilities": ["face"], "capacity": 4}),
    )
    .await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/processors/P1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(bed.registry.get("P1").is_none());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/processors/P1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn readiness_requires_ingest_and_one_active_processor() {
    let bed = TestBed::new();
    let router = app(control_state(&bed));

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    bed.consumer.start().await.unwrap();
    bed.add_processor("P1", &["face"], 4).await;

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ─────────────────────────────────────────────────────────────────────────────
// Round-trip law
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn frame_survives_the_stream_hop_bit_for_bit() {
    let streams = MemoryStreams::new();
    let mut f = frame("t11_c1_1", Some("face,object"), Some(6));
    f.content_ref = Some("s3://bucket/key.jpg".to_string());
    f.metadata
        .insert("vendor".to_string(), json!({"nested": [1, 2, 3]}));
    // Wire timestamps carry millisecond precision
    f.timestamp = chrono::DateTime::parse_from_rfc3339(
        &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    )
    .unwrap()
    .with_timezone(&Utc);

    streams.add(INGEST, &f.to_fields(), None).await.unwrap();
    streams
        .create_group(INGEST, GROUP, GroupStart::Beginning)
        .await
        .unwrap();
    let entries = streams
        .read_group(INGEST, GROUP, "t", 10, Duration::ZERO)
        .await
        .unwrap();

    let fields: HashMap<String, String> = entries[0].fields.clone();
    let decoded = FrameEvent::from_fields(&fields).unwrap();
    assert_eq!(decoded, f);
}
