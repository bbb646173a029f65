use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::claim::HeldClaim;
use crate::error::HostwardenError;
use crate::supervisor::state::SupervisorStatus;

/// Periodically rewrites the held claim with the supervisor's current state
/// and a fresh heartbeat.
pub struct StatusReporter {
    interval: Duration,
}

impl StatusReporter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Runs until `stop` is cancelled or the claim is lost.
    pub async fn run(
        &self,
        claim: Arc<HeldClaim>,
        status: watch::Receiver<SupervisorStatus>,
        stop: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let state = status.borrow().state;
            if state.is_terminal() {
                break;
            }

            match claim.refresh(state.claim_state()).await {
                Ok(()) => {
                    tracing::trace!(host = %claim.host(), state = %state, "Heartbeat written");
                }
                Err(HostwardenError::ClaimLost(_)) => break,
                Err(e) => {
                    // Keep going: the claim only goes stale if this persists.
                    tracing::warn!(host = %claim.host(), error = %e, "Failed to write heartbeat");
                }
            }
        }
    }
}
