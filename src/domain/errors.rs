//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    #[error("Message source error: {0}")]
    Source(String),

    /// FloodWait error: caller should retry after `seconds` seconds.
    #[error("FloodWait: retry after {seconds} seconds")]
    FloodWait { seconds: u64 },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Media download failed: {0}")]
    Media(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Size mismatch after copy: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutting down: {0}")]
    Shutdown(String),
}

impl DomainError {
    /// Auth and connection failures stop the whole run; everything else is
    /// contained at the task or entity boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DomainError::Auth(_) | DomainError::Connection(_))
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DomainError::Auth(_)
                | DomainError::Connection(_)
                | DomainError::Config(_)
                | DomainError::Shutdown(_)
        )
    }

    /// Minimum wait demanded by the upstream, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DomainError::FloodWait { seconds } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }
}
