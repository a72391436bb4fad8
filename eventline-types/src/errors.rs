use crate::token::ParseTokenError;
use std::fmt;

/// Identifies the event store operation that failed.
///
/// Used by `EventStoreError::StoreFailure` and by test tooling that counts or
/// scripts failures per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Reading events from a single stream.
    ReadStream,
    /// Appending events to a stream.
    AddToStream,
    /// Reading a page of the global feed.
    GetAllEvents,
    /// Long-polling the global feed.
    WaitForEvents,
    /// Loading a stream's snapshot.
    LoadSnapshot,
    /// Saving a stream's snapshot.
    SaveSnapshot,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadStream => "read_stream",
            Self::AddToStream => "add_to_stream",
            Self::GetAllEvents => "get_all_events",
            Self::WaitForEvents => "wait_for_events",
            Self::LoadSnapshot => "load_snapshot",
            Self::SaveSnapshot => "save_snapshot",
        };
        f.write_str(name)
    }
}

/// Error type returned by event store operations.
///
/// Version conflicts are not errors: `add_to_stream` reports them as
/// [`AppendOutcome::Conflict`](crate::AppendOutcome::Conflict). Every variant here
/// is an infrastructure or data failure the caller may retry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// The backing store failed while performing `operation`.
    #[error("{operation} operation failed: {detail}")]
    StoreFailure {
        /// The failing operation.
        operation: Operation,
        /// Backend specific description.
        detail: String,
    },

    /// The backing store cannot be reached.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    /// A persisted or transmitted token could not be parsed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// An event body could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
}

impl From<ParseTokenError> for EventStoreError {
    fn from(error: ParseTokenError) -> Self {
        Self::InvalidToken(error.text)
    }
}

/// Result type for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;
