use serde::Serialize;

use crate::claim::ClaimState;

const HISTORY_LIMIT: usize = 32;

/// Lifecycle of the remote command on a claimed host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Connecting,
    Running,
    Exited,
    Disconnected,
    Backoff,
    /// Graceful shutdown; the claim was released.
    Stopped,
    /// Another worker took the claim over.
    Abandoned,
    /// The worker gave the host up.
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorState::Stopped | SupervisorState::Abandoned | SupervisorState::Failed
        )
    }

    /// Claim state advertised to peers while in this state.
    pub fn claim_state(&self) -> ClaimState {
        match self {
            SupervisorState::Running => ClaimState::Running,
            SupervisorState::Stopped => ClaimState::Released,
            SupervisorState::Failed => ClaimState::Failed,
            _ => ClaimState::Claiming,
        }
    }

    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match self {
            Connecting => matches!(next, Running | Backoff | Stopped | Abandoned | Failed),
            Running => matches!(next, Exited | Disconnected | Stopped | Abandoned),
            Exited => matches!(next, Backoff | Stopped | Abandoned),
            Disconnected => matches!(next, Backoff | Stopped | Abandoned | Failed),
            Backoff => matches!(next, Connecting | Stopped | Abandoned),
            Stopped | Abandoned | Failed => false,
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Connecting => write!(f, "connecting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Exited => write!(f, "exited"),
            SupervisorState::Disconnected => write!(f, "disconnected"),
            SupervisorState::Backoff => write!(f, "backoff"),
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Abandoned => write!(f, "abandoned"),
            SupervisorState::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot published to the status reporter and the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub host: Option<String>,
    pub state: SupervisorState,
    /// Runs started on the current host after the first one.
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    /// Most recent states, oldest first.
    pub history: Vec<SupervisorState>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            host: None,
            state: SupervisorState::Connecting,
            restarts: 0,
            last_exit_code: None,
            history: Vec::new(),
        }
    }
}

impl SupervisorStatus {
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            history: vec![SupervisorState::Connecting],
            ..Default::default()
        }
    }

    pub fn enter(&mut self, state: SupervisorState) {
        if !self.state.can_transition_to(state) {
            tracing::warn!(from = %self.state, to = %state, "Unexpected supervisor transition");
        }
        self.state = state;
        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(state);
    }
}
