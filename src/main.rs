// frameflow - Frame Orchestrator
//
// Consumes frame-metadata events from the ingest stream and distributes
// them to a dynamic fleet of processors via per-processor work queues.
//
// Architecture:
// - Stream consumer: consumer-group reads with PEL reclaim
// - Router workers: capability matching, backpressure, fan-out writes
// - Registry + sweeper: processor lifecycle and health
// - Control plane (axum): registration, heartbeats, health, metrics
// - Streams backend: Redis in production, in-memory in demo mode
//
// Exit codes: 0 clean shutdown, 1 fatal configuration, 2 fatal runtime.

mod cli;
mod startup;

use clap::Parser;
use frameflow::config::Config;
use frameflow::error::{Backoff, FlowError};
use frameflow::orchestrator::{self, AppContext};
use frameflow::streams::{MemoryStreams, RedisStreams, Streams};
use frameflow::{demo, telemetry};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Broker connection attempts before startup fails with exit code 1
const CONNECT_RETRIES: u32 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();
    if let Some(command) = &args.command {
        cli::handle_command(command);
        return ExitCode::SUCCESS;
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("frameflow: {e}");
            return ExitCode::from(1);
        }
    };
    config.demo_mode = args.demo;

    // Precedence: RUST_LOG env var > config log level
    let default_filter = format!("frameflow={},axum=warn", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    startup::print_startup(&config);
    startup::log_startup(&config);

    let metrics = match telemetry::install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("cannot install metrics recorder: {e}");
            return ExitCode::from(1);
        }
    };

    // Root cancellation token, cancelled by SIGINT/SIGTERM
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let streams: Arc<dyn Streams> = if config.demo_mode {
        let streams: Arc<dyn Streams> = Arc::new(MemoryStreams::new());
        demo::spawn_demo(&config, streams.clone(), token.clone());
        streams
    } else {
        match connect_broker(&config.stream_endpoint).await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::error!("{e}");
                return ExitCode::from(1);
            }
        }
    };

    let ctx = AppContext::new(config, streams);
    match orchestrator::run(ctx, metrics, token).await {
        Ok(()) => {
            tracing::info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(FlowError::Config(e)) => {
            tracing::error!("fatal configuration error: {e}");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!("fatal runtime error: {e}");
            ExitCode::from(2)
        }
    }
}

/// Connect to the broker, spending the connect-retry budget
async fn connect_broker(endpoint: &str) -> Result<Arc<dyn Streams>, FlowError> {
    let mut backoff = Backoff::new();
    let mut last_err = String::new();

    for attempt in 1..=CONNECT_RETRIES {
        match RedisStreams::connect(endpoint).await {
            Ok(streams) => {
                tracing::info!(endpoint, "connected to stream broker");
                return Ok(Arc::new(streams));
            }
            Err(e) => {
                last_err = e.to_string();
                tracing::warn!(attempt, endpoint, "broker connect failed: {last_err}");
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
    Err(FlowError::Config(format!(
        "broker '{endpoint}' unreachable after {CONNECT_RETRIES} attempts: {last_err}"
    )))
}

/// Cancel the root token on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler installation");
            tokio::select! {
                _ = ctrl_c => tracing::info!("SIGINT received"),
                _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("interrupt received");
        }

        token.cancel();
    });
}
