use std::time::Duration;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Firewall error: {0}")]
    FirewallError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::IoError(err.to_string())
    }
}

/// Failures of a single remote console exchange. All of them are recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Console not configured: {0}")]
    NotConfigured(String),

    #[error("Console unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Console authentication failed")]
    AuthenticationFailed,

    #[error("Console protocol error: {0}")]
    ProtocolError(String),

    #[error("Console timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Version feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("No download link with type '{0}'")]
    NoMatchingArtifact(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Install failed: {0}")]
    Io(#[from] std::io::Error),
}
