#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared vocabulary types and the storage contract for Eventline.
//!
//! This crate holds the types that storage adapters and the `eventline` core
//! agree on: feed [`Token`]s, [`ExpectedVersion`] checks, stored and new events,
//! snapshots and the [`EventStore`] trait. Adapters such as `eventline-memory`
//! depend only on this crate's surface (re-exported by `eventline`).

mod cancel;
mod errors;
mod event;
mod store;
mod token;
mod version;

pub use cancel::CancelSignal;
pub use errors::{EventStoreError, EventStoreResult, Operation};
pub use event::{
    AppendOutcome, FeedPage, NewEvent, Snapshot, StoredEvent, StreamName, StreamNameError,
    StreamSlice, JSON_FORMAT,
};
pub use store::EventStore;
pub use token::{ParseTokenError, Token};
pub use version::ExpectedVersion;
