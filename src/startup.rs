// Startup module - banner and effective-configuration logging
//
// Printed before the tracing subscriber takes over stdout, so operators
// see where the orchestrator points without raising the log level.

use frameflow::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}frameflow{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Frame orchestrator: ingest -> capability routing -> processor queues{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!();

    if config.demo_mode {
        println!("  {YELLOW}▸{RESET} {YELLOW}Demo mode{RESET} {DIM}(in-memory streams, synthetic cameras){RESET}");
    } else {
        println!(
            "  {MAGENTA}▸{RESET} Broker {BOLD}{}{RESET} {DIM}stream {}{RESET}",
            config.stream_endpoint, config.ingest_stream
        );
    }
    println!(
        "  {MAGENTA}▸{RESET} Control plane on {BOLD}:{}{RESET}",
        config.http_port
    );
    println!();
}

/// Log the effective configuration at info level
pub fn log_startup(config: &Config) {
    tracing::info!(
        version = VERSION,
        ingest_stream = config.ingest_stream,
        consumer_group = config.consumer_group,
        consumer_id = config.consumer_id,
        http_port = config.http_port,
        router_concurrency = config.router.concurrency,
        queue_bound_default = config.router.queue_bound_default,
        "starting frameflow"
    );
    tracing::debug!(
        block_ms = config.consumer.block.as_millis() as u64,
        pel_reclaim_ms = config.consumer.pel_reclaim.as_millis() as u64,
        pel_max = config.consumer.pel_max,
        pel_pause = config.consumer.pel_pause,
        soft_overflow = config.router.soft_overflow_factor,
        hard_overflow = config.router.hard_overflow_factor,
        unhealthy_after_secs = config.registry.unhealthy_after.as_secs(),
        evict_after_secs = config.registry.evict_after.as_secs(),
        "effective limits"
    );
}
