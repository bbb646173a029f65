use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostwardenError {
    #[error("Claim conflict on host {0}")]
    ClaimConflict(String),

    #[error("No host available to claim")]
    NoHostAvailable,

    #[error("Claim on host {0} was taken over by another worker")]
    ClaimLost(String),

    #[error("Authentication failed for host {host}: {message}")]
    Auth { host: String, message: String },

    #[error("Network error for host {host}: {message}")]
    Network { host: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Claim store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostwardenError {
    /// Whether the operation that produced this error may be attempted again.
    ///
    /// `ClaimLost` is not retryable for the same host; the worker has to
    /// start host acquisition from scratch.
    pub fn is_retryable(&self) -> bool {
        match self {
            HostwardenError::ClaimConflict(_)
            | HostwardenError::NoHostAvailable
            | HostwardenError::Auth { .. }
            | HostwardenError::Network { .. }
            | HostwardenError::Store(_)
            | HostwardenError::Http(_)
            | HostwardenError::Io(_) => true,
            HostwardenError::ClaimLost(_)
            | HostwardenError::Config(_)
            | HostwardenError::Inventory(_)
            | HostwardenError::Json(_) => false,
        }
    }

    /// Configuration-class errors terminate the worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HostwardenError::Config(_) | HostwardenError::Inventory(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HostwardenError>;
