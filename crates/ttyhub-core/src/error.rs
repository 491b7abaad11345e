use thiserror::Error;

/// Errors produced by the ttyhub protocol and session layers.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("no session '{0}' found")]
    SessionNotFound(String),

    #[error("session specifier '{0}' is ambiguous")]
    AmbiguousSession(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::InvalidEvent(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
