//! In-memory adapters for Eventline
//!
//! This crate provides in-memory implementations of the storage contract
//! ([`InMemoryEventStore`]), the process metadata and lock provider
//! ([`InMemoryMetadataProvider`]), the push notification bus
//! ([`InMemoryNotificationBus`]) and the dead-letter log
//! ([`InMemoryDeadLetters`]). They are useful for testing and development
//! scenarios where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod dead_letters;
mod metadata;

pub use bus::InMemoryNotificationBus;
pub use dead_letters::InMemoryDeadLetters;
pub use metadata::{InMemoryMetadataProvider, InMemoryProcessMetadata};

use async_trait::async_trait;
use eventline::{
    AppendOutcome, CancelSignal, EventStore, EventStoreResult, ExpectedVersion, FeedPage,
    NewEvent, Snapshot, StoredEvent, StreamName, StreamSlice, Token,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument};

/// Thread-safe in-memory event store for testing
///
/// Clones share the same data. Tokens are numbered from 1 in commit order.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: RwLock<State>,
    // Newest committed token, for long-polling readers
    head: watch::Sender<Token>,
}

#[derive(Default)]
struct State {
    feed: Vec<StoredEvent>,
    // Feed positions of each stream's events, in stream order
    streams: HashMap<StreamName, Vec<usize>>,
    snapshots: HashMap<StreamName, Snapshot>,
}

impl State {
    fn head(&self) -> Token {
        self.feed.last().map_or(Token::Initial, |event| event.token)
    }

    fn resolve(&self, token: Token) -> Token {
        match token {
            Token::Current => self.head(),
            other => other,
        }
    }

    fn page(&self, from: Token, max_count: usize, load_body: bool) -> FeedPage {
        let start = self.feed.partition_point(|event| event.token <= from);
        let events: Vec<StoredEvent> = self.feed[start..]
            .iter()
            .take(max_count)
            .map(|event| copy_event(event, load_body))
            .collect();
        let next_token = events.last().map_or(from, |event| event.token);
        FeedPage { events, next_token }
    }
}

fn copy_event(event: &StoredEvent, load_body: bool) -> StoredEvent {
    let mut copy = event.clone();
    if !load_body {
        copy.body = None;
    }
    copy
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        let (head, _) = watch::channel(Token::Initial);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                head,
            }),
        }
    }

    /// Token of the newest committed event (`Token::Initial` when empty).
    pub fn head(&self) -> Token {
        self.inner.state.read().head()
    }

    /// Number of committed events across all streams.
    pub fn event_count(&self) -> usize {
        self.inner.state.read().feed.len()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("InMemoryEventStore")
            .field("events", &state.feed.len())
            .field("streams", &state.streams.len())
            .field("head", &state.head())
            .finish()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn read_stream(
        &self,
        stream_name: &StreamName,
        min_version: u64,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<StreamSlice> {
        let state = self.inner.state.read();
        let Some(positions) = state.streams.get(stream_name) else {
            return Ok(StreamSlice::default());
        };

        let skip = usize::try_from(min_version.saturating_sub(1)).unwrap_or(usize::MAX);
        let events = positions
            .iter()
            .skip(skip)
            .take(max_count)
            .map(|position| copy_event(&state.feed[*position], load_body))
            .collect();

        Ok(StreamSlice {
            stream_version: positions.len() as u64,
            events,
        })
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn add_to_stream(
        &self,
        stream_name: &StreamName,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> EventStoreResult<AppendOutcome> {
        let (outcome, head) = {
            let mut state = self.inner.state.write();
            let current = state
                .streams
                .get(stream_name)
                .map_or(0, |positions| positions.len() as u64);

            if !expected_version.verify(current) {
                debug!(current, ?expected_version, "version conflict");
                return Ok(AppendOutcome::Conflict {
                    current_version: current,
                });
            }

            let mut tokens = Vec::with_capacity(events.len());
            let mut stream_version = current;
            for event in events {
                let position = state.feed.len();
                let token = Token::Numbered(position as u64 + 1);
                stream_version += 1;
                state.feed.push(StoredEvent {
                    event_type: event.event_type,
                    format: event.format,
                    body: Some(event.body),
                    stream_name: Some(stream_name.clone()),
                    stream_version,
                    token,
                });
                state
                    .streams
                    .entry(stream_name.clone())
                    .or_default()
                    .push(position);
                tokens.push(token);
            }

            let committed = !tokens.is_empty();
            (
                AppendOutcome::Committed {
                    stream_version,
                    tokens,
                },
                committed.then(|| state.head()),
            )
        };

        if let Some(head) = head {
            let _ = self.inner.head.send_replace(head);
        }
        Ok(outcome)
    }

    async fn get_all_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<FeedPage> {
        let state = self.inner.state.read();
        let from = state.resolve(*from_token);
        Ok(state.page(from, max_count, load_body))
    }

    #[instrument(skip(self, cancel))]
    async fn wait_for_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
        cancel: &CancelSignal,
    ) -> EventStoreResult<FeedPage> {
        // Subscribe before the first read so no commit can slip in between.
        let mut head = self.inner.head.subscribe();
        let from = self.inner.state.read().resolve(*from_token);

        loop {
            let page = self.inner.state.read().page(from, max_count, load_body);
            if !page.is_empty() || max_count == 0 {
                return Ok(page);
            }

            tokio::select! {
                changed = head.changed() => {
                    if changed.is_err() {
                        return Ok(FeedPage::empty(from));
                    }
                }
                () = cancel.cancelled() => {
                    debug!("wait cancelled");
                    return Ok(FeedPage::empty(from));
                }
            }
        }
    }

    async fn load_snapshot(&self, stream_name: &StreamName) -> EventStoreResult<Option<Snapshot>> {
        Ok(self.inner.state.read().snapshots.get(stream_name).cloned())
    }

    async fn save_snapshot(
        &self,
        stream_name: &StreamName,
        mut snapshot: Snapshot,
    ) -> EventStoreResult<()> {
        snapshot.stream_name = stream_name.clone();
        let _ = self
            .inner
            .state
            .write()
            .snapshots
            .insert(stream_name.clone(), snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stream(name: &str) -> StreamName {
        StreamName::try_new(name).expect("valid stream name")
    }

    fn event(n: u32) -> NewEvent {
        NewEvent::new("Numbered", "json", format!(r#"{{"n":{n}}}"#))
    }

    #[tokio::test]
    async fn tokens_are_global_and_versions_per_stream() {
        let store = InMemoryEventStore::new();

        let _ = store
            .add_to_stream(&stream("a"), vec![event(1), event(2)], ExpectedVersion::NEW)
            .await
            .expect("append");
        let outcome = store
            .add_to_stream(&stream("b"), vec![event(3)], ExpectedVersion::NEW)
            .await
            .expect("append");

        assert_eq!(
            outcome,
            AppendOutcome::Committed {
                stream_version: 1,
                tokens: vec![Token::Numbered(3)],
            }
        );
        let slice = store
            .read_stream(&stream("a"), 0, 10, true)
            .await
            .expect("read");
        let versions: Vec<u64> = slice.events.iter().map(|e| e.stream_version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn current_token_resolves_to_the_head() {
        let store = InMemoryEventStore::new();
        let _ = store
            .add_to_stream(&stream("a"), vec![event(1), event(2)], ExpectedVersion::Any)
            .await
            .expect("append");

        let page = store
            .get_all_events(&Token::Current, 10, true)
            .await
            .expect("read");

        assert!(page.is_empty());
        assert_eq!(page.next_token, Token::Numbered(2));
    }

    #[tokio::test]
    async fn reads_without_body_strip_payloads() {
        let store = InMemoryEventStore::new();
        let _ = store
            .add_to_stream(&stream("a"), vec![event(1)], ExpectedVersion::Any)
            .await
            .expect("append");

        let page = store
            .get_all_events(&Token::Initial, 10, false)
            .await
            .expect("read");

        assert_eq!(page.events[0].body, None);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_reader_wakes_on_commit() {
        let store = InMemoryEventStore::new();
        let reader = store.clone();
        let waiter = tokio::spawn(async move {
            reader
                .wait_for_events(&Token::Initial, 10, true, &CancelSignal::new())
                .await
        });
        tokio::task::yield_now().await;

        let _ = store
            .add_to_stream(&stream("a"), vec![event(1)], ExpectedVersion::Any)
            .await
            .expect("append");

        let page = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("task")
            .expect("read");
        assert_eq!(page.next_token, Token::Numbered(1));
    }
}
