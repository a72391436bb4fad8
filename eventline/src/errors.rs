//! Error types for the process coordination layer.

use eventline_types::{EventStoreError, ParseTokenError};
use std::fmt::Display;

/// Errors raised by a [`ProcessMetadata`](crate::ProcessMetadata) backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The metadata backend could not be reached or failed the operation.
    #[error("metadata for process '{process}' unavailable: {detail}")]
    Unavailable {
        /// Name of the process whose metadata was accessed.
        process: String,
        /// Backend specific description.
        detail: String,
    },

    /// A persisted checkpoint could not be parsed.
    #[error("stored checkpoint is not a valid token: {0}")]
    InvalidToken(#[from] ParseTokenError),
}

/// Failure classification returned by event handlers.
///
/// The process drivers decide what happens next from the variant alone:
/// transient failures are retried once, conflicts stop projectors in
/// `Conflicted`, everything else is fatal.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A failure that may succeed when the same event is delivered again.
    #[error("transient failure: {0}")]
    Transient(String),

    /// An optimistic concurrency conflict.
    #[error("concurrency conflict: {0}")]
    Conflict(String),

    /// Anything else, including events whose body cannot be decoded.
    #[error("handler failed: {0}")]
    Fatal(String),
}

impl HandlerError {
    /// Wraps `error` as a transient failure.
    pub fn transient(error: impl Display) -> Self {
        Self::Transient(error.to_string())
    }

    /// Wraps `error` as a concurrency conflict.
    pub fn conflict(error: impl Display) -> Self {
        Self::Conflict(error.to_string())
    }

    /// Wraps `error` as a fatal failure.
    pub fn fatal(error: impl Display) -> Self {
        Self::Fatal(error.to_string())
    }
}

impl From<EventStoreError> for HandlerError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::SerializationFailed(_) | EventStoreError::InvalidToken(_) => {
                Self::Fatal(error.to_string())
            }
            EventStoreError::StoreFailure { .. } | EventStoreError::Unavailable(_) => {
                Self::Transient(error.to_string())
            }
        }
    }
}

/// Errors returned by a [`Process`](crate::Process) handle.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The process task has ended and accepts no more commands.
    #[error("process '{0}' has shut down")]
    ShutDown(String),
}

/// Errors raised while parsing a [`PushMessage`](crate::PushMessage).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PushMessageError {
    /// The body lacks the `\r\n` separator between token and event body.
    #[error("push message body has no token separator")]
    MissingSeparator,

    /// The token part of the body is not a valid numbered token.
    #[error("push message carries an invalid token: {0:?}")]
    InvalidToken(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Result type returned by event handlers.
pub type HandlerResult = Result<(), HandlerError>;
