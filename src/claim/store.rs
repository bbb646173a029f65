use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::claim::record::{claim_key, host_from_key, Claim};
use crate::error::Result;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The stored value no longer matched the expected prior value.
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Shared key/value store holding every worker's claims.
///
/// Implementations must make `conditional_write` linearizable per host.
/// Nothing is promised across hosts.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// All claims, keyed by host name.
    async fn read_all(&self) -> Result<HashMap<String, Claim>>;

    /// Store `new` for `host` only if the current value equals `expected`
    /// (`None` meaning "no claim stored").
    async fn conditional_write(
        &self,
        host: &str,
        expected: Option<&Claim>,
        new: &Claim,
    ) -> Result<CasOutcome>;

    async fn read(&self, host: &str) -> Result<Option<Claim>> {
        Ok(self.read_all().await?.remove(host))
    }
}

/// In-process claim store with the same compare-and-swap contract as the
/// shared one.
#[derive(Debug, Default)]
pub struct MemoryClaimStore {
    annotations: RwLock<HashMap<String, Claim>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from pre-existing claims, e.g. ones left behind by crashed
    /// workers.
    pub fn with_claims(claims: impl IntoIterator<Item = (String, Claim)>) -> Self {
        let annotations = claims
            .into_iter()
            .map(|(host, claim)| (claim_key(&host), claim))
            .collect();
        Self {
            annotations: RwLock::new(annotations),
        }
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn read_all(&self) -> Result<HashMap<String, Claim>> {
        let annotations = self.annotations.read().await;
        Ok(annotations
            .iter()
            .filter_map(|(key, claim)| host_from_key(key).map(|h| (h.to_string(), claim.clone())))
            .collect())
    }

    async fn conditional_write(
        &self,
        host: &str,
        expected: Option<&Claim>,
        new: &Claim,
    ) -> Result<CasOutcome> {
        let key = claim_key(host);
        let mut annotations = self.annotations.write().await;
        if annotations.get(&key) != expected {
            return Ok(CasOutcome::Conflict);
        }
        annotations.insert(key, new.clone());
        Ok(CasOutcome::Applied)
    }
}
