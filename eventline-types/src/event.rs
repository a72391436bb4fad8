use crate::errors::{EventStoreError, EventStoreResult};
use crate::token::Token;
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Format tag used for bodies written by [`NewEvent::json`].
pub const JSON_FORMAT: &str = "json";

/// Stream name domain type.
///
/// Stream names are trimmed, non-empty and at most 255 characters long.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamName(String);

/// An event as committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Type name used for handler dispatch.
    pub event_type: String,
    /// Serialization format of `body`.
    pub format: String,
    /// Serialized payload; `None` when the event was read without bodies.
    pub body: Option<String>,
    /// The stream the event belongs to.
    ///
    /// `None` for events delivered from a push message, whose payload does not
    /// carry stream coordinates.
    pub stream_name: Option<StreamName>,
    /// 1-based position in its own stream (0 when unknown).
    pub stream_version: u64,
    /// Global position in the feed.
    pub token: Token,
}

impl StoredEvent {
    /// Deserializes the JSON body.
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> EventStoreResult<T> {
        let body = self.body.as_deref().ok_or_else(|| {
            EventStoreError::SerializationFailed(format!(
                "event {} at token {} was loaded without a body",
                self.event_type, self.token
            ))
        })?;
        serde_json::from_str(body)
            .map_err(|error| EventStoreError::SerializationFailed(error.to_string()))
    }
}

/// An event a producer appends to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Type name used for handler dispatch.
    pub event_type: String,
    /// Serialization format of `body`.
    pub format: String,
    /// Serialized payload.
    pub body: String,
}

impl NewEvent {
    /// Creates an event from an already serialized body.
    pub fn new(
        event_type: impl Into<String>,
        format: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            format: format.into(),
            body: body.into(),
        }
    }

    /// Serializes `payload` as JSON.
    pub fn json<T: Serialize>(event_type: impl Into<String>, payload: &T) -> EventStoreResult<Self> {
        let body = serde_json::to_string(payload)
            .map_err(|error| EventStoreError::SerializationFailed(error.to_string()))?;
        Ok(Self::new(event_type, JSON_FORMAT, body))
    }
}

/// The single snapshot slot of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Type name of the snapshotted state.
    pub snapshot_type: String,
    /// Serialization format of `body`.
    pub format: String,
    /// Serialized state.
    pub body: String,
    /// The stream the snapshot belongs to. Stores overwrite it on save.
    pub stream_name: StreamName,
}

/// Result of [`EventStore::read_stream`](crate::EventStore::read_stream).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSlice {
    /// The stream's current version (0 for a stream that does not exist).
    pub stream_version: u64,
    /// Events in stream order.
    pub events: Vec<StoredEvent>,
}

/// A page of the global feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    /// Events in global order.
    pub events: Vec<StoredEvent>,
    /// Token to resume from; the last event's token, or the requested token
    /// when the page is empty.
    pub next_token: Token,
}

impl FeedPage {
    /// A page with no events that resumes from `token`.
    pub const fn empty(token: Token) -> Self {
        Self {
            events: Vec::new(),
            next_token: token,
        }
    }

    /// Number of events in the page.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when the page holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Result of [`EventStore::add_to_stream`](crate::EventStore::add_to_stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The events were committed.
    Committed {
        /// The stream version after the append.
        stream_version: u64,
        /// Global tokens assigned to the appended events, in order.
        tokens: Vec<Token>,
    },
    /// The version check failed; nothing was written.
    Conflict {
        /// The stream's version at the time of the check.
        current_version: u64,
    },
}

impl AppendOutcome {
    /// True when the events were committed.
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Tokens of the committed events; empty on conflict.
    pub fn tokens(&self) -> &[Token] {
        match self {
            Self::Committed { tokens, .. } => tokens,
            Self::Conflict { .. } => &[],
        }
    }
}
