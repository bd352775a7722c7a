use shared::error::ApiError;
use thiserror::Error;

/// Failure of a request/response call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Status(ApiError),
    #[error("authentication expired")]
    AuthExpired,
}

/// Failure of the push channel. Never fatal: connect failures feed the
/// reconnect policy and malformed frames are dropped.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect push channel {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("malformed push frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("push channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid request: {0}")]
    Validation(String),
}

impl ChatError {
    /// True when the failure left local state untouched and the caller may
    /// simply retry the operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(TransportError::AuthExpired))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
