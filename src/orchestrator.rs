// Orchestrator wiring - build the components and run them to completion
//
// Explicit application context instead of globals: every long-lived task
// (ingest reader, router workers, registry sweeper, backpressure sampler,
// control plane) gets Arc handles and a child of the root cancellation
// token. The supervisor restarts a crashed ingest reader with backoff and
// escalates to a fatal error once restarts stop helping; everything else
// ends the process when it dies.

use crate::backpressure::BackpressureController;
use crate::config::Config;
use crate::consumer::StreamConsumer;
use crate::control::{self, ControlState};
use crate::error::{Backoff, FlowError, FlowResult};
use crate::queues::WorkQueueManager;
use crate::registry::{ProcessorState, Registry};
use crate::router::Router;
use crate::streams::Streams;
use crate::telemetry;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Consecutive ingest-reader crashes before the process gives up
const CONSUMER_RESTART_BUDGET: u32 = 5;
/// Backpressure sampling cadence
const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Everything the orchestrator's tasks share
pub struct AppContext {
    pub config: Config,
    pub streams: Arc<dyn Streams>,
    pub registry: Arc<Registry>,
    pub queues: Arc<WorkQueueManager>,
    pub backpressure: Arc<BackpressureController>,
    pub consumer: Arc<StreamConsumer>,
    pub router: Arc<Router>,
}

impl AppContext {
    pub fn new(config: Config, streams: Arc<dyn Streams>) -> Self {
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
            config.ingest_stream.clone(),
            config.consumer_group.clone(),
            config.consumer_id.clone(),
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
            config,
            streams,
            registry,
            queues,
            backpressure,
            consumer,
            router,
        }
    }
}

/// Run the orchestrator until the token cancels or a task dies fatally
pub async fn run(
    ctx: AppContext,
    metrics: PrometheusHandle,
    token: CancellationToken,
) -> FlowResult<()> {
    // Reachability check spends the connect-retry budget; failure here is
    // a ConfigError and exit code 1
    ctx.consumer.start().await?;

    let state = ControlState {
        registry: ctx.registry.clone(),
        queues: ctx.queues.clone(),
        backpressure: ctx.backpressure.clone(),
        consumer: ctx.consumer.clone(),
        metrics,
    };

    // Decoded frames flow to the router workers over a bounded channel;
    // a stalled router backpressures the reader naturally
    let (tx, rx) = mpsc::channel(ctx.config.router.concurrency * 2);
    let rx = Arc::new(Mutex::new(rx));

    let mut tasks: JoinSet<FlowResult<()>> = JoinSet::new();

    // Control plane
    {
        let state = state.clone();
        let port = ctx.config.http_port;
        let token = token.clone();
        tasks.spawn(async move { control::serve(state, port, token).await });
    }

    // Ingest reader, supervised with restart-on-failure
    {
        let consumer = ctx.consumer.clone();
        let backpressure = ctx.backpressure.clone();
        let token = token.clone();
        tasks.spawn(async move {
            let mut backoff = Backoff::new();
            let mut crashes = 0u32;
            loop {
                match consumer.run(tx.clone(), backpressure.clone(), token.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        crashes += 1;
                        if crashes >= CONSUMER_RESTART_BUDGET {
                            return Err(FlowError::PermanentTransport(format!(
                                "ingest reader failed {crashes} times, giving up: {e}"
                            )));
                        }
                        let delay = backoff.next_delay();
                        tracing::error!(
                            crashes,
                            "ingest reader crashed, restarting in {delay:?}: {e}"
                        );
                        tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
    }

    // Router worker pool
    for _ in 0..ctx.config.router.concurrency {
        let router = ctx.router.clone();
        let rx = rx.clone();
        let consumer = ctx.consumer.clone();
        let token = token.clone();
        tasks.spawn(async move {
            router.run_worker(rx, consumer, token).await;
            Ok(())
        });
    }

    // Registry sweeper
    {
        let registry = ctx.registry.clone();
        let queues = ctx.queues.clone();
        let interval = ctx.config.registry.sweep_interval;
        let token = token.clone();
        tasks.spawn(async move {
            run_sweeper(registry, queues, interval, token).await;
            Ok(())
        });
    }

    // Backpressure sampler
    {
        let backpressure = ctx.backpressure.clone();
        let streams = ctx.streams.clone();
        let queues = ctx.queues.clone();
        let registry = ctx.registry.clone();
        let ingest_stream = ctx.config.ingest_stream.clone();
        let ingest_group = ctx.config.consumer_group.clone();
        let token = token.clone();
        tasks.spawn(async move {
            backpressure
                .run_sampler(
                    streams,
                    queues,
                    registry,
                    ingest_stream,
                    ingest_group,
                    SAMPLE_INTERVAL,
                    token,
                )
                .await;
            Ok(())
        });
    }

    // Supervise: the first fatal error or external cancellation ends the
    // run; remaining tasks get the shutdown grace to finish in-flight work
    let mut fatal: Option<FlowError> = None;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => {
                    tracing::error!("task failed fatally: {e}");
                    fatal = Some(e);
                    token.cancel();
                    break;
                }
                Some(Err(join_err)) => {
                    tracing::error!("task panicked: {join_err}");
                    fatal = Some(FlowError::PermanentTransport(join_err.to_string()));
                    token.cancel();
                    break;
                }
            }
        }
    }

    let grace = ctx.config.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(?grace, "shutdown grace elapsed, aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    match fatal {
        Some(e) => Err(e),
        None => {
            tracing::info!("orchestrator stopped cleanly");
            Ok(())
        }
    }
}

/// Periodic registry sweep: demote silent processors, finish drains, and
/// evict only once the work-queue PELs no longer reference the id
async fn run_sweeper(
    registry: Arc<Registry>,
    queues: Arc<WorkQueueManager>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {}
        }

        let report = registry.sweep(Utc::now());
        for id in &report.newly_unhealthy {
            tracing::warn!(processor_id = id, "processor missed heartbeats, now Unhealthy");
        }
        for id in &report.drained {
            queues.forget(id);
        }
        for id in &report.evictable {
            match queues.pel_owners(id).await {
                Ok(owners) if owners.is_empty() => {
                    registry.evict(id);
                    queues.forget(id);
                }
                Ok(owners) => {
                    tracing::debug!(
                        processor_id = id,
                        ?owners,
                        "eviction deferred, queue PEL still owned"
                    );
                }
                Err(e) => tracing::debug!(processor_id = id, "PEL owner check failed: {e}"),
            }
        }

        publish_state_gauges(&registry);
    }
    tracing::debug!("registry sweeper stopped");
}

fn publish_state_gauges(registry: &Registry) {
    let mut by_state = std::collections::HashMap::new();
    let snapshot = registry.snapshot();
    for d in &snapshot {
        *by_state.entry(d.state).or_insert(0u64) += 1;
    }
    for state in [
        ProcessorState::Registering,
        ProcessorState::Active,
        ProcessorState::Draining,
        ProcessorState::Unhealthy,
    ] {
        let count = by_state.get(&state).copied().unwrap_or(0);
        metrics::gauge!(telemetry::PROCESSOR_STATE, "state" => state.as_str())
            .set(count as f64);
    }
    metrics::gauge!(telemetry::REGISTRY_PROCESSORS).set(snapshot.len() as f64);
}
