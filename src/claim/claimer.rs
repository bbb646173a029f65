use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::claim::record::{Claim, ClaimState};
use crate::claim::store::{CasOutcome, ClaimStore};
use crate::config::ClaimConfig;
use crate::error::{HostwardenError, Result};
use crate::inventory::{HostEntry, Inventory};

/// A host this worker now owns, with the exact claim value it wrote.
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub host: HostEntry,
    pub claim: Claim,
}

/// Races peers for one unclaimed or abandoned host using nothing but the
/// store's per-key compare-and-swap.
#[derive(Debug, Clone)]
pub struct HostClaimer {
    worker_id: String,
    config: ClaimConfig,
}

impl HostClaimer {
    pub fn new(worker_id: impl Into<String>, config: ClaimConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim exactly one host.
    ///
    /// Candidates are tried in host-name order (a restarted worker's own
    /// claims first when the self-claim fast path is on). Losing a race moves
    /// on to the next candidate. Fails with `ClaimConflict` when every
    /// candidate was lost to a peer, and with `NoHostAvailable` when there
    /// was nothing to race for.
    pub async fn acquire(&self, inventory: &Inventory, store: &dyn ClaimStore) -> Result<Acquisition> {
        let claims = store.read_all().await?;
        let now = Utc::now();

        let mut candidates: Vec<(&HostEntry, Option<&Claim>)> = inventory
            .hosts()
            .iter()
            .map(|host| (host, claims.get(&host.name)))
            .filter(|(_, claim)| self.is_claimable(*claim, now))
            .collect();
        candidates.sort_by(|(a, ca), (b, cb)| {
            let own_a = ca.is_some_and(|c| c.is_owned_by(&self.worker_id));
            let own_b = cb.is_some_and(|c| c.is_owned_by(&self.worker_id));
            own_b.cmp(&own_a).then_with(|| a.name.cmp(&b.name))
        });

        tracing::debug!(
            worker_id = %self.worker_id,
            hosts = inventory.len(),
            candidates = candidates.len(),
            "Scanning for claimable hosts"
        );

        let mut store_error = None;
        let mut lost_race = None;
        for (host, current) in candidates {
            let claim = Claim::new(self.worker_id.clone(), ClaimState::Claiming);
            match store.conditional_write(&host.name, current, &claim).await {
                Ok(CasOutcome::Applied) => {
                    tracing::info!(
                        worker_id = %self.worker_id,
                        host = %host.name,
                        previous_owner = ?current.map(|c| c.owner_id.as_str()),
                        "Claim acquired"
                    );
                    return Ok(Acquisition {
                        host: host.clone(),
                        claim,
                    });
                }
                Ok(CasOutcome::Conflict) => {
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        host = %host.name,
                        "Lost claim race, trying next host"
                    );
                    lost_race = Some(host.name.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        host = %host.name,
                        error = %e,
                        "Claim write failed"
                    );
                    store_error.get_or_insert(e);
                }
            }
        }

        Err(match (store_error, lost_race) {
            (Some(e), _) => e,
            (None, Some(host)) => HostwardenError::ClaimConflict(host),
            (None, None) => HostwardenError::NoHostAvailable,
        })
    }

    /// Whether a host with this stored claim may be taken by this worker.
    pub fn is_claimable(&self, claim: Option<&Claim>, now: DateTime<Utc>) -> bool {
        let Some(claim) = claim else {
            return true;
        };
        if claim.is_stale(now, self.config.stale_after()) {
            return true;
        }
        let own = claim.is_owned_by(&self.worker_id);
        match claim.state {
            ClaimState::Released => true,
            // Let someone else try a host this worker gave up on.
            ClaimState::Failed => !own,
            ClaimState::Claiming | ClaimState::Running => own && self.config.self_claim_fast_path,
        }
    }

    /// Delay before the next acquisition attempt, spread over
    /// `[base, 2 * base]` so retrying workers do not move in lockstep.
    pub fn retry_delay(&self) -> Duration {
        let base = self.config.acquire_retry_ms;
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::store::MemoryClaimStore;

    fn inventory(names: &[&str]) -> Inventory {
        Inventory::new(names.iter().map(|n| HostEntry::local(*n)).collect()).unwrap()
    }

    fn claimer(worker: &str) -> HostClaimer {
        HostClaimer::new(worker, ClaimConfig::default())
    }

    #[tokio::test]
    async fn claims_first_host_by_name() {
        let store = MemoryClaimStore::new();
        let acquired = claimer("pod-a")
            .acquire(&inventory(&["app3", "app1", "app2"]), &store)
            .await
            .unwrap();
        assert_eq!(acquired.host.name, "app1");
        assert_eq!(acquired.claim.state, ClaimState::Claiming);
        assert_eq!(store.read("app1").await.unwrap(), Some(acquired.claim));
    }

    #[tokio::test]
    async fn skips_live_claims_of_others() {
        let store = MemoryClaimStore::with_claims([(
            "app1".to_string(),
            Claim::new("pod-b", ClaimState::Running),
        )]);
        let acquired = claimer("pod-a")
            .acquire(&inventory(&["app1", "app2"]), &store)
            .await
            .unwrap();
        assert_eq!(acquired.host.name, "app2");
    }

    #[tokio::test]
    async fn no_host_available_when_all_live() {
        let store = MemoryClaimStore::with_claims([(
            "app1".to_string(),
            Claim::new("pod-b", ClaimState::Running),
        )]);
        let err = claimer("pod-a")
            .acquire(&inventory(&["app1"]), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, HostwardenError::NoHostAvailable));
    }

    /// Every write loses to a peer that got there first.
    struct ContendedStore;

    #[async_trait::async_trait]
    impl ClaimStore for ContendedStore {
        async fn read_all(&self) -> Result<std::collections::HashMap<String, Claim>> {
            Ok(Default::default())
        }

        async fn conditional_write(
            &self,
            _host: &str,
            _expected: Option<&Claim>,
            _new: &Claim,
        ) -> Result<CasOutcome> {
            Ok(CasOutcome::Conflict)
        }
    }

    #[tokio::test]
    async fn losing_every_race_is_a_claim_conflict() {
        let err = claimer("pod-a")
            .acquire(&inventory(&["app1", "app2"]), &ContendedStore)
            .await
            .unwrap_err();
        assert!(matches!(err, HostwardenError::ClaimConflict(ref host) if host == "app2"));
        assert!(err.is_retryable());
    }

    #[test]
    fn stale_and_released_claims_are_claimable() {
        let c = claimer("pod-a");
        let now = Utc::now();
        let stale = Claim::at("pod-b", ClaimState::Running, now - chrono::Duration::minutes(5));
        let released = Claim::at("pod-b", ClaimState::Released, now);
        let live = Claim::at("pod-b", ClaimState::Running, now);

        assert!(c.is_claimable(None, now));
        assert!(c.is_claimable(Some(&stale), now));
        assert!(c.is_claimable(Some(&released), now));
        assert!(!c.is_claimable(Some(&live), now));
    }

    #[test]
    fn own_failed_claim_is_skipped_until_stale() {
        let c = claimer("pod-a");
        let now = Utc::now();
        let own_failed = Claim::at("pod-a", ClaimState::Failed, now);
        let other_failed = Claim::at("pod-b", ClaimState::Failed, now);
        assert!(!c.is_claimable(Some(&own_failed), now));
        assert!(c.is_claimable(Some(&other_failed), now));

        let later = now + chrono::Duration::minutes(5);
        assert!(c.is_claimable(Some(&own_failed), later));
    }

    #[test]
    fn self_claim_fast_path_is_opt_in() {
        let now = Utc::now();
        let own_live = Claim::at("pod-a", ClaimState::Running, now);

        assert!(!claimer("pod-a").is_claimable(Some(&own_live), now));

        let fast = HostClaimer::new(
            "pod-a",
            ClaimConfig {
                self_claim_fast_path: true,
                ..ClaimConfig::default()
            },
        );
        assert!(fast.is_claimable(Some(&own_live), now));
    }

    #[tokio::test]
    async fn fast_path_prefers_own_previous_host() {
        let store = MemoryClaimStore::with_claims([(
            "app3".to_string(),
            Claim::new("pod-a", ClaimState::Running),
        )]);
        let fast = HostClaimer::new(
            "pod-a",
            ClaimConfig {
                self_claim_fast_path: true,
                ..ClaimConfig::default()
            },
        );
        let acquired = fast
            .acquire(&inventory(&["app1", "app2", "app3"]), &store)
            .await
            .unwrap();
        assert_eq!(acquired.host.name, "app3");
    }

    #[test]
    fn retry_delay_stays_within_jitter_window() {
        let c = HostClaimer::new(
            "pod-a",
            ClaimConfig {
                acquire_retry_ms: 100,
                ..ClaimConfig::default()
            },
        );
        for _ in 0..50 {
            let d = c.retry_delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }
}
