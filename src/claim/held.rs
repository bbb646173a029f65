use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::claim::record::{Claim, ClaimState};
use crate::claim::store::ClaimStore;
use crate::error::{HostwardenError, Result};

/// The claim this worker currently owns.
///
/// Every write is a conditional write whose expected value is the claim this
/// worker itself wrote last, so a worker can only ever overwrite its own
/// claim. A conflict is re-checked against the store: once another worker
/// owns the key (or it is gone) the claim is marked lost and every later
/// write fails with `ClaimLost`.
pub struct HeldClaim {
    store: Arc<dyn ClaimStore>,
    host: String,
    worker_id: String,
    last: Mutex<Claim>,
    lost: CancellationToken,
}

impl HeldClaim {
    pub fn new(store: Arc<dyn ClaimStore>, host: impl Into<String>, claim: Claim) -> Self {
        Self {
            store,
            host: host.into(),
            worker_id: claim.owner_id.clone(),
            last: Mutex::new(claim),
            lost: CancellationToken::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Cancelled once a takeover by another worker has been observed.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// The value most recently written by this worker.
    pub async fn current(&self) -> Claim {
        self.last.lock().await.clone()
    }

    /// Write `state` with a fresh heartbeat.
    ///
    /// A claim that has been released or marked failed is final and further
    /// refreshes are no-ops.
    pub async fn refresh(&self, state: ClaimState) -> Result<()> {
        let mut last = self.last.lock().await;
        if !last.state.is_held() {
            return Ok(());
        }
        self.write_locked(&mut last, state).await
    }

    /// Give the host back. Releasing twice is a no-op.
    pub async fn release(&self) -> Result<()> {
        let mut last = self.last.lock().await;
        if last.state == ClaimState::Released {
            return Ok(());
        }
        self.write_locked(&mut last, ClaimState::Released).await?;
        tracing::info!(host = %self.host, worker_id = %self.worker_id, "Claim released");
        Ok(())
    }

    /// Record that this worker gave up on the host.
    pub async fn mark_failed(&self) -> Result<()> {
        let mut last = self.last.lock().await;
        if !last.state.is_held() {
            return Ok(());
        }
        self.write_locked(&mut last, ClaimState::Failed).await?;
        tracing::warn!(host = %self.host, worker_id = %self.worker_id, "Claim marked failed");
        Ok(())
    }

    async fn write_locked(&self, last: &mut Claim, state: ClaimState) -> Result<()> {
        if self.is_lost() {
            return Err(HostwardenError::ClaimLost(self.host.clone()));
        }

        let mut adopted = false;
        loop {
            let next = Claim::new(self.worker_id.clone(), state);
            if self
                .store
                .conditional_write(&self.host, Some(&*last), &next)
                .await?
                .is_applied()
            {
                *last = next;
                return Ok(());
            }

            // A write can land in the store even though its response was lost.
            // Only a different owner, or no claim at all, means a takeover.
            match self.store.read(&self.host).await? {
                Some(stored) if stored.owner_id == self.worker_id => {
                    if !stored.state.is_held() {
                        *last = stored;
                        return Ok(());
                    }
                    if adopted {
                        return Err(HostwardenError::Store(format!(
                            "claim for {} keeps changing under its owner",
                            self.host
                        )));
                    }
                    tracing::debug!(
                        host = %self.host,
                        worker_id = %self.worker_id,
                        "Adopting claim from an unconfirmed earlier write"
                    );
                    *last = stored;
                    adopted = true;
                }
                _ => {
                    tracing::warn!(
                        host = %self.host,
                        worker_id = %self.worker_id,
                        "Claim taken over by another worker"
                    );
                    self.lost.cancel();
                    return Err(HostwardenError::ClaimLost(self.host.clone()));
                }
            }
        }
    }
}
