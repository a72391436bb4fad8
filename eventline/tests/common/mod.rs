//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use eventline::{
    decode_json, EventMeta, EventStore, EventStreaming, EventType, ExpectedVersion, HandlerError,
    HandlerResult, Handles, NewEvent, ProcessName, StoredEvent, StreamName, Token,
};
use eventline_memory::{
    InMemoryDeadLetters, InMemoryEventStore, InMemoryMetadataProvider, InMemoryNotificationBus,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The one event type of the tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
}

impl EventType for Message {
    const TYPE_NAME: &'static str = "Message";

    fn decode(event: &StoredEvent) -> Result<Self, HandlerError> {
        decode_json(event)
    }
}

pub fn message(text: &str) -> NewEvent {
    NewEvent::json(
        Message::TYPE_NAME,
        &Message {
            text: text.to_owned(),
        },
    )
    .expect("serializable message")
}

pub fn process_name(name: &str) -> ProcessName {
    ProcessName::try_new(name).expect("valid process name")
}

pub fn stream(name: &str) -> StreamName {
    StreamName::try_new(name).expect("valid stream name")
}

/// Appends one message per text and returns their tokens.
pub async fn append_messages<S: EventStore + ?Sized>(store: &S, texts: &[&str]) -> Vec<Token> {
    let events = texts.iter().map(|text| message(text)).collect();
    store
        .add_to_stream(&stream("messages"), events, ExpectedVersion::Any)
        .await
        .expect("append")
        .tokens()
        .to_vec()
}

/// Fails the test instead of hanging when `future` never completes.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("timed out")
}

/// In-memory adapters wired together.
pub struct World {
    pub store: InMemoryEventStore,
    pub provider: InMemoryMetadataProvider,
    pub bus: Arc<InMemoryNotificationBus>,
    pub dead_letters: InMemoryDeadLetters,
}

impl World {
    pub fn new() -> Self {
        Self {
            store: InMemoryEventStore::new(),
            provider: InMemoryMetadataProvider::new(),
            bus: Arc::new(InMemoryNotificationBus::new()),
            dead_letters: InMemoryDeadLetters::new(),
        }
    }

    pub fn streaming(&self) -> EventStreaming {
        EventStreaming::new(Arc::new(self.store.clone()))
            .with_notifications(self.bus.clone())
            .with_dead_letters(Arc::new(self.dead_letters.clone()))
    }
}

/// Shared, inspectable list of what a handler saw.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock").clone()
    }
}

/// Handler that journals each message, failing on request.
///
/// `fatal` texts fail permanently. `flaky` texts fail transiently on their
/// first attempt, journaled with a trailing `!`.
#[derive(Debug, Default)]
pub struct Recorder {
    pub journal: Journal,
    pub fatal: Vec<String>,
    pub flaky: Vec<String>,
}

#[async_trait]
impl Handles<Message> for Recorder {
    async fn handle(&mut self, event: Message, _meta: &EventMeta) -> HandlerResult {
        if self.fatal.contains(&event.text) {
            return Err(HandlerError::fatal(format!("cannot handle {}", event.text)));
        }
        if let Some(position) = self.flaky.iter().position(|text| *text == event.text) {
            let _ = self.flaky.remove(position);
            self.journal.push(format!("{}!", event.text));
            return Err(HandlerError::transient("try again"));
        }
        self.journal.push(event.text);
        Ok(())
    }
}
