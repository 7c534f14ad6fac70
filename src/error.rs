// Error taxonomy shared by the orchestrator and the processor client
//
// The variants mirror how failures propagate: configuration problems are
// fatal at startup, transient transport errors are retried with backoff,
// permanent ones escalate to the supervising task, and the remaining kinds
// surface as HTTP statuses or metric increments.

use std::time::Duration;

/// Convenience alias used throughout the crate
pub type FlowResult<T> = Result<T, FlowError>;

/// All failure kinds the pipeline distinguishes
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Invalid configuration; fatal at startup (exit code 1)
    #[error("configuration error: {0}")]
    Config(String),

    /// Stream/HTTP failure worth retrying with backoff
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// Transport failure that survived the retry budget (exit code 2 when fatal)
    #[error("permanent transport error: {0}")]
    PermanentTransport(String),

    /// Registration rejected; surfaced as 409
    #[error("registration conflict: {0}")]
    Conflict(String),

    /// Admission denied by the backpressure controller
    #[error("admission denied: {0}")]
    Saturation(String),

    /// Malformed incoming entry; dead-lettered, never crashes the process
    #[error("invalid entry: {0}")]
    Validation(String),

    /// Processor handler failed; entry stays unacked for redelivery
    #[error("handler failed: {0}")]
    Handler(String),
}

impl FlowError {
    /// Whether a caller should retry after backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, FlowError::TransientTransport(_))
    }

    /// Classify a redis error into the transient/permanent split.
    ///
    /// I/O and loading/cluster conditions resolve themselves on reconnect;
    /// everything else (bad command, type mismatch, auth) will not get
    /// better by retrying.
    pub fn from_redis(err: redis::RedisError) -> Self {
        use redis::ErrorKind;
        match err.kind() {
            ErrorKind::IoError
            | ErrorKind::BusyLoadingError
            | ErrorKind::TryAgain
            | ErrorKind::ClusterDown
            | ErrorKind::MasterDown => FlowError::TransientTransport(err.to_string()),
            _ => FlowError::PermanentTransport(err.to_string()),
        }
    }
}

/// Exponential backoff schedule for transient transport errors.
///
/// Base 100ms doubling to a 5s cap, with +/-20% jitter so a fleet of
/// consumers does not reconnect in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
        }
    }

    /// Delay for the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        use rand::Rng;

        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        // +/-20% jitter
        let jitter = rand::rng().random_range(0.8..1.2);
        capped.mul_f64(jitter)
    }

    /// Reset after a success so the next failure starts at the base delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
