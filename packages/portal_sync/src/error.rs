//! Error taxonomy for the synchronization core.
//!
//! Transport faults on the push channel are not represented here as returned
//! errors: `ConnectionManager` absorbs them and reports a status event instead.

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("pull request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pull request to {route} returned {status}")]
    Status {
        route: String,
        status: reqwest::StatusCode,
    },

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("push channel: {0}")]
    Transport(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("configuration: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(Box::new(err))
    }
}

impl SyncError {
    /// Whether the failure happened on the pull path and the caller owns retry.
    pub fn is_pull_failure(&self) -> bool {
        matches!(self, SyncError::Http(_) | SyncError::Status { .. })
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
