use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Namespace for claim keys in the annotation store.
pub const CLAIM_KEY_PREFIX: &str = "hostClaim/";

pub fn claim_key(host: &str) -> String {
    format!("{}{}", CLAIM_KEY_PREFIX, host)
}

pub fn host_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(CLAIM_KEY_PREFIX).filter(|h| !h.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Claiming,
    Running,
    Failed,
    Released,
}

impl ClaimState {
    /// Claiming and Running assert ownership; Failed and Released give it up.
    pub fn is_held(&self) -> bool {
        matches!(self, ClaimState::Claiming | ClaimState::Running)
    }
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Claiming => write!(f, "claiming"),
            ClaimState::Running => write!(f, "running"),
            ClaimState::Failed => write!(f, "failed"),
            ClaimState::Released => write!(f, "released"),
        }
    }
}

/// One worker's assertion of ownership over one host, stored under
/// `hostClaim/<host>`.
///
/// Heartbeats carry millisecond precision so a claim survives a round trip
/// through its text form unchanged and can be used as the expected value of
/// a conditional write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub owner_id: String,
    pub state: ClaimState,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_heartbeat: DateTime<Utc>,
}

impl Claim {
    pub fn new(owner_id: impl Into<String>, state: ClaimState) -> Self {
        Self::at(owner_id, state, Utc::now())
    }

    pub fn at(owner_id: impl Into<String>, state: ClaimState, heartbeat: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            state,
            last_heartbeat: heartbeat.trunc_subsecs(3),
        }
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner_id == worker_id
    }

    /// Time since the last heartbeat. A heartbeat in the future (clock skew
    /// between workers) counts as fresh.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }

    /// Held and fresh: nobody else may take the host.
    pub fn is_live(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.state.is_held() && !self.is_stale(now, stale_after)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
