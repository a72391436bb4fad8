#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Eventline
//!
//! The event-sourcing backbone of a CQRS application: streaming over a
//! globally ordered event store, long-running processes and projections with
//! crash recovery and single-writer locking, and "wait until processed"
//! tracking for producers that need read-your-writes consistency.
//!
//! ## Layers
//!
//! - [`EventStore`] (from `eventline-types`): the storage contract.
//! - [`EventStreaming`] / [`EventStreamer`]: batched, long-polling cursors that
//!   also wake on [`PushMessage`]s.
//! - [`Process`]: the lifecycle state machine around a [`ProcessWorker`],
//!   guarded by the lock of its [`ProcessMetadata`].
//! - [`SimpleProcess`] and [`ProjectorProcess`]: the two event-loop drivers.
//! - [`EventProcessTracking`]: trackers producers wait on.
//!
//! ## Example
//!
//! ```ignore
//! use eventline::*;
//!
//! let streaming = EventStreaming::new(store.clone()).with_notifications(bus);
//! let process = SimpleProcess::builder(ProcessName::try_new("mailer")?, Mailer::default())
//!     .register::<OrderPlaced>()
//!     .spawn(streaming, &metadata_provider);
//! process.start()?;
//! ```

pub mod config;
mod dead_letter;
mod dispatch;
mod errors;
mod metadata;
mod process;
mod projector;
mod push;
mod simple;
mod streaming;
mod tracking;

pub use eventline_types::*;

pub use config::{
    BatchSize, ErrorRetryDelayMs, FlushThreshold, ProcessConfig, StreamingConfig,
    TrackerRetentionSecs, TrackingConfig,
};
pub use dead_letter::{DeadLetter, DeadLetterLog};
pub use dispatch::{
    decode_json, EventMeta, EventType, Flush, Handles, HandlerRegistry, RebuildFinished, Reset,
    UpgradeFrom,
};
pub use errors::{
    HandlerError, HandlerResult, MetadataError, MetadataResult, ProcessError, PushMessageError,
};
pub use metadata::{LockState, MetadataProvider, ProcessMetadata};
pub use process::{
    Flow, Process, ProcessName, ProcessNameError, ProcessState, ProcessStats, ProcessWorker,
    WorkerContext,
};
pub use projector::{decide_upgrade, Projection, ProjectorProcess, UpgradeMode};
pub use push::{Destination, NotificationBus, PushMessage, ANY_SUBJECT, PUSH_FORMAT};
pub use simple::SimpleProcess;
pub use streaming::{EventStreamer, EventStreaming};
pub use tracking::{EventProcessTracking, Tracker, TrackerSource, TrackingId};
