//! Error types for the queue and consumer surface

use std::time::Duration;
use thiserror::Error;

/// Errors produced by queue backends and the consumer engine
#[derive(Debug, Error)]
pub enum Error {
    /// The backend only supports push-style delivery; reserving is disabled.
    ///
    /// A fetcher that receives this exits permanently. `add`-driven
    /// processing keeps working.
    #[error("operation is not supported by the queue")]
    NotSupported,

    /// `process_one` found neither a buffered nor a reservable message
    #[error("queue is empty")]
    QueueEmpty,

    /// In-flight messages did not drain within the shutdown grace period.
    ///
    /// The processor keeps running; the caller may retry with a longer
    /// timeout.
    #[error("workers did not stop after {timeout:?}")]
    StopTimeout {
        /// The grace period that elapsed
        timeout: Duration,
    },

    /// A message carrying a dedup name was already added
    #[error("message with name {name:?} already exists")]
    Duplicate {
        /// The dedup key that collided
        name: String,
    },

    /// Queue options failed validation
    #[error("invalid queue options: {0}")]
    Config(String),

    /// Shared-lock or pub/sub backend failure
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Handler failure surfaced by `process`/`process_one`
    #[error("handler failed: {0}")]
    Handler(#[from] crate::handler::HandlerError),

    /// Transient backend failure from reserve/release/delete
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    /// Whether this is the push-only sentinel
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported)
    }
}

/// Result alias for queue and consumer operations
pub type Result<T> = std::result::Result<T, Error>;
