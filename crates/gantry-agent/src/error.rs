//! Error types for agent-side operations.

use thiserror::Error;

/// Failure of an agent to server call.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote call '{call}' failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("Server rejected '{call}' with status {status}")]
    Rejected { call: &'static str, status: u16 },

    #[error("Server unreachable: {0}")]
    Unreachable(String),
}

/// Failure while fetching or saving an artifact.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid artifact url '{0}'")]
    InvalidUrl(String),

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Server returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Verification of the integrity of the artifact [{path}] failed")]
    Integrity { path: String },

    #[error("Invalid artifact archive: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DownloadError::Status { status: 404, .. })
    }
}

/// Failure to bring a material's working copy to a revision.
#[derive(Debug, Error)]
pub enum MaterialUpdateError {
    #[error("{0}")]
    Failed(String),

    #[error("No updater registered for material type '{0}'")]
    NoUpdater(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to load agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid server url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

/// Failure of the agent to take on or finish a job.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Agent is shutting down")]
    ShuttingDown,
}
