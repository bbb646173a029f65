use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{HostwardenError, Result};

/// Claim protocol timing and policy.
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// A claim whose heartbeat is older than this is presumed abandoned.
    pub stale_after_ms: u64,
    /// How often the held claim's heartbeat is refreshed.
    pub heartbeat_interval_ms: u64,
    /// Treat a live claim already owned by this worker id as immediately
    /// reclaimable (worker restarted with the same identity).
    pub self_claim_fast_path: bool,
    /// Base delay before retrying acquisition when no host is available.
    pub acquire_retry_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 60_000,
            heartbeat_interval_ms: 10_000,
            self_claim_fast_path: false,
            acquire_retry_ms: 5_000,
        }
    }
}

impl ClaimConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    /// Ceiling for a single delay.
    pub max_ms: u64,
    pub multiplier: f64,
    /// A run that lasted at least this long resets the backoff sequence.
    pub reset_after_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            reset_after_ms: 60_000,
        }
    }
}

/// Remote command supervision settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Command line run on the claimed host.
    pub command: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on the best-effort claim release during shutdown.
    pub release_timeout_ms: u64,
    /// Give the host up after this many consecutive connect/disconnect
    /// failures. `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
    /// Copy the worker's own stdin into the remote process.
    pub forward_stdin: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            connect_timeout_ms: 10_000,
            release_timeout_ms: 5_000,
            max_consecutive_failures: None,
            forward_stdin: false,
        }
    }
}

impl SupervisorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique runtime identity of this worker (the pod name when scheduled).
    pub worker_id: String,
    pub claim: ClaimConfig,
    pub backoff: BackoffConfig,
    pub supervisor: SupervisorConfig,
    /// Serve `/health` and `/status` here when set.
    pub status_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            claim: ClaimConfig::default(),
            backoff: BackoffConfig::default(),
            supervisor: SupervisorConfig::default(),
            status_addr: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            supervisor: SupervisorConfig {
                command: command.into(),
                ..SupervisorConfig::default()
            },
            ..Default::default()
        }
    }

    pub fn with_claim(mut self, claim: ClaimConfig) -> Self {
        self.claim = claim;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }

    /// Reject settings that would break the claim protocol or the backoff
    /// bound.
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(HostwardenError::Config("worker id must not be empty".into()));
        }
        if self.supervisor.command.trim().is_empty() {
            return Err(HostwardenError::Config("command must not be empty".into()));
        }
        if self.claim.heartbeat_interval_ms == 0 {
            return Err(HostwardenError::Config(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.claim.heartbeat_interval_ms >= self.claim.stale_after_ms {
            return Err(HostwardenError::Config(format!(
                "heartbeat interval ({}ms) must be shorter than the staleness threshold ({}ms)",
                self.claim.heartbeat_interval_ms, self.claim.stale_after_ms
            )));
        }
        if self.supervisor.max_consecutive_failures == Some(0) {
            return Err(HostwardenError::Config(
                "max consecutive failures must be at least 1".into(),
            ));
        }
        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(HostwardenError::Config(format!(
                "initial backoff ({}ms) exceeds maximum ({}ms)",
                self.backoff.initial_ms, self.backoff.max_ms
            )));
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(HostwardenError::Config(
                "backoff multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// The scheduler exposes the pod name as HOSTNAME; fall back to a random id
/// outside a cluster.
fn default_worker_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
}
