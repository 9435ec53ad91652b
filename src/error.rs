//! Error taxonomy for the sync core.
//!
//! Transport and timeout failures are recoverable (reconnect/backoff on the
//! channel, rollback on intents). Authentication failures are never retried
//! here; the auth collaborator owns re-establishing identity.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("not authenticated")]
    Unauthenticated,

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}
