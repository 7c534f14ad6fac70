//! Configuration for the orchestrator and processor client defaults
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/frameflow/config.toml, or FRAMEFLOW_CONFIG)
//! 3. Built-in defaults (lowest priority)
//!
//! Every invalid value is a fatal `ConfigError`: the process exits 1 at
//! startup rather than running with a half-understood setup.

use crate::error::{FlowError, FlowResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;


/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Stream name conventions (wire contract, not configurable)
// ─────────────────────────────────────────────────────────────────────────────

/// Consumer group every processor joins on its own queue
pub const PROCESSOR_GROUP: &str = "frame-processors";
/// Dead-letter stream for entries that failed field-level decoding
pub const MALFORMED_DLQ: &str = "frames:dlq:_malformed";
/// Downstream stream processors append results to
pub const PROCESSED_STREAM: &str = "frames:processed";

/// Queue stream for one processor
pub fn queue_name(processor_id: &str) -> String {
    format!("frames:ready:{processor_id}")
}

/// Dead-letter stream for one processor
pub fn dlq_name(processor_id: &str) -> String {
    format!("frames:dlq:{processor_id}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// What the router does with a frame whose predicate is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyPredicate {
    /// Deliver to every Active processor (default; observability tooling
    /// relies on seeing the full feed)
    Broadcast,
    /// Discard with a counter increment
    Drop,
}

impl FromStr for EmptyPredicate {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Self::Broadcast),
            "drop" => Ok(Self::Drop),
            other => Err(FlowError::Config(format!(
                "ROUTE_EMPTY_PREDICATE must be 'broadcast' or 'drop', got '{other}'"
            ))),
        }
    }
}

/// Stream-consumer knobs
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Max entries per blocking group read
    pub batch_size: usize,
    /// Blocking read budget
    pub block: Duration,
    /// Pending entries older than this are claimed from any consumer
    pub pel_reclaim: Duration,
    /// Hard cap on the ingest PEL before new reads pause
    pub pel_max: u64,
    /// Pause threshold, derived from `pel_max` and the pause percentage
    pub pel_pause: u64,
}

/// Router / admission knobs
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Concurrent routing workers
    pub concurrency: usize,
    /// A processor with `inflight >= capacity * soft` is saturated
    pub soft_overflow_factor: f64,
    /// Spill never pushes a processor past `capacity * hard`
    pub hard_overflow_factor: f64,
    /// Per-queue write retry budget
    pub write_retries: u32,
    /// Budget for one frame's complete routing attempt
    pub route_timeout: Duration,
    /// Empty-predicate policy
    pub empty_predicate: EmptyPredicate,
    /// Work-queue length bound when a processor does not override it
    pub queue_bound_default: u64,
}

/// Registry lifecycle knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub sweep_interval: Duration,
    /// Silence longer than this marks a processor Unhealthy
    pub unhealthy_after: Duration,
    /// Unhealthy/Draining longer than this becomes eviction
    pub evict_after: Duration,
    /// consecutive_failures at which the sampler requests Unhealthy
    pub failure_threshold: u32,
    pub max_processors: usize,
}

/// Processor-client knobs: used directly by demo mode's clients and as the
/// documented defaults for library users
#[derive(Debug, Clone)]
pub struct ClientDefaults {
    pub heartbeat_interval: Duration,
    pub handler_concurrency: usize,
    pub max_redeliveries: u64,
    pub batch_size: usize,
    pub read_fatal_after: Duration,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker endpoint, e.g. redis://127.0.0.1:6379
    pub stream_endpoint: String,
    /// Ingest stream name
    pub ingest_stream: String,
    /// Orchestrator consumer group on the ingest stream
    pub consumer_group: String,
    /// This instance's consumer name within the group
    pub consumer_id: String,
    /// Control-plane HTTP port
    pub http_port: u16,
    /// Demo mode: in-memory backend with a synthetic feed
    pub demo_mode: bool,
    /// Default tracing filter level when RUST_LOG is unset
    pub log_level: String,
    /// Bounded wait for in-flight work at shutdown
    pub shutdown_grace: Duration,

    pub consumer: ConsumerConfig,
    pub router: RouterConfig,
    pub registry: RegistryConfig,
    pub client: ClientDefaults,
}

impl Default for Config {
    fn default() -> Self {
        let pel_max = 100_000;
        Self {
            stream_endpoint: "redis://127.0.0.1:6379".to_string(),
            ingest_stream: "frames:metadata".to_string(),
            consumer_group: "frame-buffer-group".to_string(),
            consumer_id: default_consumer_id(),
            http_port: 8002,
            demo_mode: false,
            log_level: "info".to_string(),
            shutdown_grace: Duration::from_secs(30),
            consumer: ConsumerConfig {
                batch_size: 32,
                block: Duration::from_millis(1000),
                pel_reclaim: Duration::from_millis(60_000),
                pel_max,
                pel_pause: pel_max * 80 / 100,
            },
            router: RouterConfig {
                concurrency: default_concurrency(),
                soft_overflow_factor: 1.0,
                hard_overflow_factor: 2.0,
                write_retries: 3,
                route_timeout: Duration::from_secs(2),
                empty_predicate: EmptyPredicate::Broadcast,
                queue_bound_default: 10_000,
            },
            registry: RegistryConfig {
                sweep_interval: Duration::from_secs(5),
                unhealthy_after: Duration::from_secs(30),
                evict_after: Duration::from_secs(300),
                failure_threshold: 5,
                max_processors: 1024,
            },
            client: ClientDefaults {
                heartbeat_interval: Duration::from_secs(5),
                handler_concurrency: 4,
                max_redeliveries: 5,
                batch_size: 16,
                read_fatal_after: Duration::from_secs(60),
            },
        }
    }
}

fn default_consumer_id() -> String {
    format!("orchestrator-{}", uuid::Uuid::new_v4().simple())
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub stream_endpoint: Option<String>,
    pub ingest_stream: Option<String>,
    pub consumer_group: Option<String>,
    pub consumer_id: Option<String>,
    pub http_port: Option<u16>,
    pub log_level: Option<String>,
    pub shutdown_grace_secs: Option<u64>,

    /// Optional [consumer] section
    pub consumer: Option<FileConsumer>,

    /// Optional [router] section
    pub router: Option<FileRouter>,

    /// Optional [registry] section
    pub registry: Option<FileRegistry>,

    /// Optional [client] section
    pub client: Option<FileClient>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConsumer {
    pub batch_size: Option<usize>,
    pub block_ms: Option<u64>,
    pub pel_reclaim_ms: Option<u64>,
    pub pel_max: Option<u64>,
    pub pel_pause_pct: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileRouter {
    pub concurrency: Option<usize>,
    pub soft_overflow_factor: Option<f64>,
    pub hard_overflow_factor: Option<f64>,
    pub write_retries: Option<u32>,
    pub route_timeout_secs: Option<u64>,
    pub empty_predicate: Option<String>,
    pub queue_bound_default: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileRegistry {
    pub sweep_interval_secs: Option<u64>,
    pub unhealthy_after_secs: Option<u64>,
    pub evict_after_secs: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub max_processors: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileClient {
    pub heartbeat_interval_secs: Option<u64>,
    pub handler_concurrency: Option<usize>,
    pub max_redeliveries: Option<u64>,
    pub batch_size: Option<usize>,
    pub read_fatal_after_secs: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an env var, naming it in the error on failure
fn env_parse<T: FromStr>(name: &str) -> FlowResult<Option<T>> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| FlowError::Config(format!("invalid value '{raw}' for {name}"))),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

impl Config {
    /// Config file path: FRAMEFLOW_CONFIG, else ~/.config/frameflow/config.toml
    pub fn config_path() -> Option<PathBuf> {
        if let Some(explicit) = env_string("FRAMEFLOW_CONFIG") {
            return Some(PathBuf::from(explicit));
        }
        dirs::home_dir().map(|p| p.join(".config").join("frameflow").join("config.toml"))
    }

    /// Load file config if it exists; a present-but-broken file is fatal
    fn load_file_config() -> FlowResult<FileConfig> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| FlowError::Config(format!("cannot parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(FlowError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> FlowResult<Self> {
        let file = Self::load_file_config()?;
        Self::resolve(file)
    }

    pub(crate) fn resolve(file: FileConfig) -> FlowResult<Self> {
        let defaults = Config::default();
        let file_consumer = file.consumer.unwrap_or_default();
        let file_router = file.router.unwrap_or_default();
        let file_registry = file.registry.unwrap_or_default();
        let file_client = file.client.unwrap_or_default();

        let secs = Duration::from_secs;
        let millis = Duration::from_millis;

        let pel_max = env_parse("PEL_MAX")?
            .or(file_consumer.pel_max)
            .unwrap_or(defaults.consumer.pel_max);
        let pel_pause_pct: u8 = env_parse("PEL_PAUSE_PCT")?
            .or(file_consumer.pel_pause_pct)
            .unwrap_or(80);
        if pel_pause_pct == 0 || pel_pause_pct > 100 {
            return Err(FlowError::Config(format!(
                "PEL_PAUSE_PCT must be in 1..=100, got {pel_pause_pct}"
            )));
        }

        let consumer = ConsumerConfig {
            batch_size: env_parse("BATCH_SIZE")?
                .or(file_consumer.batch_size)
                .unwrap_or(defaults.consumer.batch_size),
            block: env_parse("BLOCK_MS")?
                .or(file_consumer.block_ms)
                .map(millis)
                .unwrap_or(defaults.consumer.block),
            pel_reclaim: env_parse("PEL_RECLAIM_MS")?
                .or(file_consumer.pel_reclaim_ms)
                .map(millis)
                .unwrap_or(defaults.consumer.pel_reclaim),
            pel_max,
            pel_pause: pel_max * pel_pause_pct as u64 / 100,
        };

        let soft = env_parse("SOFT_OVERFLOW_FACTOR")?
            .or(file_router.soft_overflow_factor)
            .unwrap_or(defaults.router.soft_overflow_factor);
        let hard = env_parse("HARD_OVERFLOW_FACTOR")?
            .or(file_router.hard_overflow_factor)
            .unwrap_or(defaults.router.hard_overflow_factor);
        if soft <= 0.0 || hard < soft {
            return Err(FlowError::Config(format!(
                "overflow factors must satisfy 0 < soft <= hard, got soft={soft} hard={hard}"
            )));
        }

        let empty_predicate =
            match env_string("ROUTE_EMPTY_PREDICATE").or(file_router.empty_predicate) {
                Some(raw) => raw.parse()?,
                None => defaults.router.empty_predicate,
            };

        let router = RouterConfig {
            concurrency: env_parse("ROUTER_CONCURRENCY")?
                .or(file_router.concurrency)
                .unwrap_or(defaults.router.concurrency)
                .max(1),
            soft_overflow_factor: soft,
            hard_overflow_factor: hard,
            write_retries: env_parse("WRITE_RETRIES")?
                .or(file_router.write_retries)
                .unwrap_or(defaults.router.write_retries),
            route_timeout: env_parse("ROUTE_TIMEOUT")?
                .or(file_router.route_timeout_secs)
                .map(secs)
                .unwrap_or(defaults.router.route_timeout),
            empty_predicate,
            queue_bound_default: env_parse("QUEUE_BOUND_DEFAULT")?
                .or(file_router.queue_bound_default)
                .unwrap_or(defaults.router.queue_bound_default),
        };

        let registry = RegistryConfig {
            sweep_interval: env_parse("SWEEP_INTERVAL")?
                .or(file_registry.sweep_interval_secs)
                .map(secs)
                .unwrap_or(defaults.registry.sweep_interval),
            unhealthy_after: env_parse("UNHEALTHY_AFTER")?
                .or(file_registry.unhealthy_after_secs)
                .map(secs)
                .unwrap_or(defaults.registry.unhealthy_after),
            evict_after: env_parse("EVICT_AFTER")?
                .or(file_registry.evict_after_secs)
                .map(secs)
                .unwrap_or(defaults.registry.evict_after),
            failure_threshold: env_parse("FAILURE_THRESHOLD")?
                .or(file_registry.failure_threshold)
                .unwrap_or(defaults.registry.failure_threshold),
            max_processors: env_parse("MAX_PROCESSORS")?
                .or(file_registry.max_processors)
                .unwrap_or(defaults.registry.max_processors),
        };

        let client = ClientDefaults {
            heartbeat_interval: env_parse("HEARTBEAT_INTERVAL")?
                .or(file_client.heartbeat_interval_secs)
                .map(secs)
                .unwrap_or(defaults.client.heartbeat_interval),
            handler_concurrency: env_parse("HANDLER_CONCURRENCY")?
                .or(file_client.handler_concurrency)
                .unwrap_or(defaults.client.handler_concurrency)
                .max(1),
            max_redeliveries: env_parse("MAX_REDELIVERIES")?
                .or(file_client.max_redeliveries)
                .unwrap_or(defaults.client.max_redeliveries),
            // Distinct from BATCH_SIZE: this sizes the processors' queue
            // reads, not the orchestrator's ingest reads
            batch_size: env_parse("CLIENT_BATCH_SIZE")?
                .or(file_client.batch_size)
                .unwrap_or(defaults.client.batch_size),
            read_fatal_after: env_parse("READ_FATAL_AFTER")?
                .or(file_client.read_fatal_after_secs)
                .map(secs)
                .unwrap_or(defaults.client.read_fatal_after),
        };

        Ok(Self {
            stream_endpoint: env_string("STREAM_ENDPOINT")
                .or(file.stream_endpoint)
                .unwrap_or(defaults.stream_endpoint),
            ingest_stream: env_string("INGEST_STREAM")
                .or(file.ingest_stream)
                .unwrap_or(defaults.ingest_stream),
            consumer_group: env_string("CONSUMER_GROUP")
                .or(file.consumer_group)
                .unwrap_or(defaults.consumer_group),
            consumer_id: env_string("CONSUMER_ID")
                .or(file.consumer_id)
                .unwrap_or(defaults.consumer_id),
            http_port: env_parse("HTTP_PORT")?
                .or(file.http_port)
                .unwrap_or(defaults.http_port),
            demo_mode: false,
            log_level: env_string("FRAMEFLOW_LOG")
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
            shutdown_grace: env_parse("SHUTDOWN_GRACE")?
                .or(file.shutdown_grace_secs)
                .map(secs)
                .unwrap_or(defaults.shutdown_grace),
            consumer,
            router,
            registry,
            client,
        })
    }
}
