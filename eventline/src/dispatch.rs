//! Type-name keyed dispatch of stored events to typed handlers.
//!
//! A handler value `S` implements [`Handles<E>`] once per event type it
//! understands. Registering `E` on a [`HandlerRegistry<S>`] stores a
//! monomorphized thunk that decodes the stored event and calls the matching
//! `handle`. Events whose type was never registered are skipped.

use crate::errors::{HandlerError, HandlerResult};
use async_trait::async_trait;
use eventline_types::{StoredEvent, StreamName, Token, JSON_FORMAT};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// A payload type that can be decoded from a [`StoredEvent`].
pub trait EventType: Sized + Send + 'static {
    /// The `event_type` string this payload is stored under.
    const TYPE_NAME: &'static str;

    /// Decodes the payload.
    fn decode(event: &StoredEvent) -> Result<Self, HandlerError>;
}

/// Decodes a JSON body; the usual body of [`EventType::decode`].
pub fn decode_json<T: DeserializeOwned>(event: &StoredEvent) -> Result<T, HandlerError> {
    event.decode_json().map_err(HandlerError::fatal)
}

/// Where and when the event being handled was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    /// Global position of the event.
    pub token: Token,
    /// Stream of the event, when known.
    pub stream_name: Option<StreamName>,
    /// Position in its stream (0 when unknown).
    pub stream_version: u64,
}

impl EventMeta {
    fn of(event: &StoredEvent) -> Self {
        Self {
            token: event.token,
            stream_name: event.stream_name.clone(),
            stream_version: event.stream_version,
        }
    }
}

/// Handles events of type `E`.
#[async_trait]
pub trait Handles<E: EventType>: Send {
    /// Applies one event.
    async fn handle(&mut self, event: E, meta: &EventMeta) -> HandlerResult;
}

type Thunk<S> = for<'a> fn(&'a mut S, &'a StoredEvent) -> BoxFuture<'a, HandlerResult>;

fn thunk_for<'a, S, E>(state: &'a mut S, event: &'a StoredEvent) -> BoxFuture<'a, HandlerResult>
where
    S: Handles<E>,
    E: EventType,
{
    Box::pin(async move {
        let payload = E::decode(event)?;
        state.handle(payload, &EventMeta::of(event)).await
    })
}

/// Outcome of delivering one event, including the transient retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    /// `None` when no handler is registered for the event type.
    pub(crate) outcome: Option<HandlerResult>,
    /// Whether the handler was called a second time.
    pub(crate) retried: bool,
}

/// Event handlers of a handler value `S`, keyed by event type name.
pub struct HandlerRegistry<S> {
    handlers: HashMap<&'static str, Thunk<S>>,
}

impl<S: Send> HandlerRegistry<S> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Routes events named `E::TYPE_NAME` to `S`'s `Handles<E>` implementation.
    ///
    /// Registering the same type twice keeps the latest registration.
    #[must_use]
    pub fn register<E>(mut self) -> Self
    where
        S: Handles<E>,
        E: EventType,
    {
        let _ = self.handlers.insert(E::TYPE_NAME, thunk_for::<S, E>);
        self
    }

    /// True when a handler exists for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Calls the handler registered for `event.event_type`.
    ///
    /// Returns `None` when there is none.
    pub async fn dispatch(&self, state: &mut S, event: &StoredEvent) -> Option<HandlerResult> {
        let thunk = *self.handlers.get(event.event_type.as_str())?;
        Some(thunk(state, event).await)
    }

    /// Dispatches `event`, repeating the call once after a transient failure.
    ///
    /// A transient failure on the second attempt is reported as fatal.
    pub(crate) async fn deliver(&self, state: &mut S, event: &StoredEvent) -> Delivery {
        match self.dispatch(state, event).await {
            Some(Err(HandlerError::Transient(reason))) => {
                warn!(token = %event.token, event_type = %event.event_type, %reason, "transient handler failure; retrying once");
                let outcome = self.dispatch(state, event).await.map(|result| {
                    result.map_err(|error| match error {
                        HandlerError::Transient(reason) => HandlerError::Fatal(reason),
                        other => other,
                    })
                });
                Delivery {
                    outcome,
                    retried: true,
                }
            }
            outcome => Delivery {
                outcome,
                retried: false,
            },
        }
    }
}

impl<S: Send> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for HandlerRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("event_types", &names)
            .finish()
    }
}

/// Sent to a projection before it is rebuilt from the start of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reset;

/// Sent to a projection whose stored version is an older, upgradable one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeFrom {
    /// The version found in the process metadata.
    pub version: String,
}

/// Sent once a rebuilding projection has caught up with the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildFinished;

/// Sent before a projection's checkpoint is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flush;

macro_rules! system_message {
    ($message:ty, $name:literal) => {
        impl EventType for $message {
            const TYPE_NAME: &'static str = $name;

            fn decode(event: &StoredEvent) -> Result<Self, HandlerError> {
                decode_json(event)
            }
        }
    };
}

system_message!(Reset, "$eventline.Reset");
system_message!(UpgradeFrom, "$eventline.UpgradeFrom");
system_message!(RebuildFinished, "$eventline.RebuildFinished");
system_message!(Flush, "$eventline.Flush");

/// Wraps a system message in a stored event positioned at `token`.
pub(crate) fn system_event<M: EventType + Serialize>(
    message: &M,
    token: Token,
) -> Result<StoredEvent, HandlerError> {
    let body = serde_json::to_string(message).map_err(HandlerError::fatal)?;
    Ok(StoredEvent {
        event_type: M::TYPE_NAME.to_owned(),
        format: JSON_FORMAT.to_owned(),
        body: Some(body),
        stream_name: None,
        stream_version: 0,
        token,
    })
}
