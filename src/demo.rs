// Demo mode - synthetic feed against the in-memory backend
//
// Spawns a fake camera fleet appending frame events to the ingest stream
// and three processor clients (face, object, ocr) that register through
// the real control plane and consume their queues. Lets the whole
// pipeline be watched locally without a broker:
//
//   frameflow --demo
//   curl localhost:8002/processors

use crate::client::{ClientConfig, ProcessorClient};
use crate::config::Config;
use crate::frame::FrameEvent;
use crate::streams::Streams;
use crate::tracectx::TraceContext;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CAMERAS: [&str; 3] = ["cam01", "cam02", "cam03"];
const HINTS: [Option<&str>; 4] = [None, Some("face"), Some("object"), Some("face,object")];

/// Start the synthetic feed and the demo processor fleet
pub fn spawn_demo(config: &Config, streams: Arc<dyn Streams>, token: CancellationToken) {
    tracing::info!("demo mode: synthetic cameras and processors starting");

    spawn_feed(config.ingest_stream.clone(), streams.clone(), token.clone());

    for (id, caps) in [
        ("demo-face", vec!["face"]),
        ("demo-object", vec!["object"]),
        ("demo-ocr", vec!["face", "ocr"]),
    ] {
        spawn_processor(config, streams.clone(), id, caps, token.clone());
    }
}

fn spawn_feed(ingest_stream: String, streams: Arc<dyn Streams>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut seq: u64 = 0;
        let mut tick = tokio::time::interval(Duration::from_millis(150));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            seq += 1;

            let camera = CAMERAS[(seq as usize) % CAMERAS.len()];
            let mut metadata = serde_json::Map::new();
            if let Some(hint) = HINTS[(seq as usize) % HINTS.len()] {
                metadata.insert("detection_hint".to_string(), json!(hint));
            }
            metadata.insert("priority".to_string(), json!((seq % 10) as u8));

            let now = Utc::now();
            let frame = FrameEvent {
                frame_id: format!("{}_{}_{}", now.timestamp_millis(), camera, seq),
                camera_id: camera.to_string(),
                timestamp: now,
                size_bytes: 128 * 1024,
                width: 1920,
                height: 1080,
                format: "jpeg".to_string(),
                content_ref: Some(format!("demo://frames/{camera}/{seq}")),
                trace_context: TraceContext::empty().child(),
                metadata,
            };

            if let Err(e) = streams.add(&ingest_stream, &frame.to_fields(), None).await {
                tracing::warn!("demo feed write failed: {e}");
            }
        }
        tracing::debug!("demo feed stopped");
    });
}

fn spawn_processor(
    config: &Config,
    streams: Arc<dyn Streams>,
    id: &'static str,
    caps: Vec<&'static str>,
    token: CancellationToken,
) {
    let endpoint = format!("http://127.0.0.1:{}", config.http_port);
    let mut client_cfg = ClientConfig::with_defaults(
        endpoint,
        config.stream_endpoint.clone(),
        id,
        caps.iter().map(|s| s.to_string()),
        8,
        &config.client,
    );
    client_cfg.heartbeat_interval = Duration::from_secs(2);

    tokio::spawn(async move {
        let client = ProcessorClient::with_streams(client_cfg, streams);

        // The control plane comes up concurrently; retry until it answers
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                registered = client.register() => match registered {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::debug!(processor_id = id, "demo registration retry: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        let stop = client.cancellation_token();
        let forward = token.clone();
        tokio::spawn(async move {
            forward.cancelled().await;
            stop.cancel();
        });

        let outcome = client
            .consume(move |frame| async move {
                // Pretend to do detection work
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(Some(json!({
                    "frame_id": frame.frame_id,
                    "detections": frame.required_capabilities().len(),
                })))
            })
            .await;
        if let Err(e) = outcome {
            tracing::error!(processor_id = id, "demo processor exited: {e}");
        }
    });
}
