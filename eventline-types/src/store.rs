use crate::cancel::CancelSignal;
use crate::errors::EventStoreResult;
use crate::event::{AppendOutcome, FeedPage, NewEvent, Snapshot, StreamName, StreamSlice};
use crate::token::Token;
use crate::version::ExpectedVersion;
use async_trait::async_trait;
use std::sync::Arc;

/// Trait defining the contract for event store implementations.
///
/// An event store keeps named streams of events, each with its own 1-based
/// version, and a single global feed in which every committed event receives a
/// strictly increasing [`Token`]. Appends are all-or-nothing and guarded by an
/// [`ExpectedVersion`] check; a failed check is reported as
/// [`AppendOutcome::Conflict`] and leaves the store untouched.
///
/// Implementations must tolerate concurrent callers.
///
/// Implementations include:
/// - `eventline-memory`: In-memory backend for development and testing
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Reads events with `stream_version >= min_version`, at most `max_count`.
    ///
    /// A stream that does not exist yields version 0 and no events.
    async fn read_stream(
        &self,
        stream_name: &StreamName,
        min_version: u64,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<StreamSlice>;

    /// Atomically appends `events` if `expected_version` matches the stream.
    async fn add_to_stream(
        &self,
        stream_name: &StreamName,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> EventStoreResult<AppendOutcome>;

    /// Reads up to `max_count` events strictly after `from_token` in global order.
    ///
    /// With nothing new the page is empty and `next_token == from_token`.
    /// `Token::Current` yields an empty page positioned at the newest committed
    /// token.
    async fn get_all_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<FeedPage>;

    /// Like [`get_all_events`](Self::get_all_events), but suspends until at least
    /// one event exists after `from_token`.
    ///
    /// Firing `cancel` ends the wait with an empty page positioned at
    /// `from_token`; cancellation is never an error.
    async fn wait_for_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
        cancel: &CancelSignal,
    ) -> EventStoreResult<FeedPage>;

    /// Loads the stream's snapshot, if one was saved.
    async fn load_snapshot(&self, stream_name: &StreamName) -> EventStoreResult<Option<Snapshot>>;

    /// Replaces the stream's snapshot.
    async fn save_snapshot(
        &self,
        stream_name: &StreamName,
        snapshot: Snapshot,
    ) -> EventStoreResult<()>;
}

/// Blanket implementation allowing shared ownership of stores.
#[async_trait]
impl<T> EventStore for Arc<T>
where
    T: EventStore + ?Sized,
{
    async fn read_stream(
        &self,
        stream_name: &StreamName,
        min_version: u64,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<StreamSlice> {
        (**self)
            .read_stream(stream_name, min_version, max_count, load_body)
            .await
    }

    async fn add_to_stream(
        &self,
        stream_name: &StreamName,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> EventStoreResult<AppendOutcome> {
        (**self)
            .add_to_stream(stream_name, events, expected_version)
            .await
    }

    async fn get_all_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<FeedPage> {
        (**self)
            .get_all_events(from_token, max_count, load_body)
            .await
    }

    async fn wait_for_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
        cancel: &CancelSignal,
    ) -> EventStoreResult<FeedPage> {
        (**self)
            .wait_for_events(from_token, max_count, load_body, cancel)
            .await
    }

    async fn load_snapshot(&self, stream_name: &StreamName) -> EventStoreResult<Option<Snapshot>> {
        (**self).load_snapshot(stream_name).await
    }

    async fn save_snapshot(
        &self,
        stream_name: &StreamName,
        snapshot: Snapshot,
    ) -> EventStoreResult<()> {
        (**self).save_snapshot(stream_name, snapshot).await
    }
}
