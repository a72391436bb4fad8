//! Long-running event processes and their lifecycle.
//!
//! A [`Process`] is a handle on one tokio task that owns a [`ProcessWorker`],
//! its streamer and its lock. Commands travel over a mailbox; state and
//! statistics are published on `watch` channels, so transitions and handler
//! calls of one process never overlap.
//!
//! ```text
//!             start                lock held
//! Inactive ─────────▶ Starting ─────────────▶ Running
//!    ▲  ▲               │ pause / metadata      │ │ │
//!    │  └───────────────┘ failure               │ │ └── lock lost ──▶ Starting
//!    │        pause                             │ └──── conflict ───▶ Conflicted
//!    └──────────────── Pausing ◀────────────────┘ ───── fatal ──────▶ Faulted
//! ```

mod actor;

use crate::config::ProcessConfig;
use crate::errors::{MetadataResult, ProcessError};
use crate::metadata::ProcessMetadata;
use crate::streaming::{EventStreamer, EventStreaming};
use async_trait::async_trait;
use eventline_types::{StoredEvent, Token};
use nutype::nutype;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Name of a process, unique across the cluster.
///
/// Trimmed, non-empty and at most 255 characters long.
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
pub struct ProcessName(String);

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Idle; `start()` begins acquiring the lock.
    Inactive,
    /// Waiting for the lock or preparing to run.
    Starting,
    /// Holding the lock and consuming events.
    Running,
    /// Releasing the lock after `pause()`.
    Pausing,
    /// Shutting down for good.
    Stopping,
    /// Halted by a fatal handler failure; `start()` retries.
    Faulted,
    /// Halted by a concurrency conflict; `start()` retries.
    Conflicted,
}

impl ProcessState {
    /// True for the states in which the process waits for a `start()` command.
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Inactive | Self::Faulted | Self::Conflicted)
    }
}

/// Counters maintained by a running process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// Events delivered to the worker, including skipped and dead-lettered ones.
    pub events_processed: u64,
    /// Events recorded as dead letters.
    pub dead_letters: u64,
    /// Handler calls repeated after a transient failure.
    pub retries: u64,
    /// Checkpoints persisted.
    pub checkpoints_saved: u64,
}

/// What the process does after the worker handled a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep consuming.
    Continue,
    /// Stop in `Faulted`.
    Fault(String),
    /// Stop in `Conflicted`.
    Conflict(String),
}

/// Everything a worker may touch while running.
pub struct WorkerContext<'a> {
    /// Name of the running process.
    pub process_name: &'a ProcessName,
    /// The process's cursor, for dead-lettering.
    pub streamer: &'a mut EventStreamer,
    /// The process's metadata, for checkpoints.
    pub metadata: &'a dyn ProcessMetadata,
    /// Counters published after every step.
    pub stats: &'a mut ProcessStats,
}

/// The event loop body driven by a [`Process`].
#[async_trait]
pub trait ProcessWorker: Send + 'static {
    /// Called with the lock held; returns the token to stream from.
    ///
    /// A failure returns the process to `Inactive`.
    async fn prepare(&mut self, metadata: &dyn ProcessMetadata) -> MetadataResult<Token>;

    /// Called once in `Running`, before the first event.
    async fn on_started(&mut self, _cx: &mut WorkerContext<'_>) -> Flow {
        Flow::Continue
    }

    /// Handles one delivered event.
    async fn on_event(&mut self, event: StoredEvent, cx: &mut WorkerContext<'_>) -> Flow;

    /// Called when no further event is immediately available.
    async fn on_end_of_stream(&mut self, cx: &mut WorkerContext<'_>) -> Flow;
}

#[derive(Debug)]
enum Command {
    Start,
    Pause,
    Shutdown(oneshot::Sender<()>),
}

/// Handle on a spawned process.
///
/// Dropping the handle shuts the process down in the background.
#[derive(Debug)]
pub struct Process {
    name: ProcessName,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ProcessState>,
    stats: watch::Receiver<ProcessStats>,
    task: JoinHandle<()>,
}

impl Process {
    /// Spawns `worker` as process `name` in the `Inactive` state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<W: ProcessWorker>(
        name: ProcessName,
        worker: W,
        streaming: EventStreaming,
        metadata: Arc<dyn ProcessMetadata>,
        config: ProcessConfig,
    ) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ProcessState::Inactive);
        let (stats_tx, stats) = watch::channel(ProcessStats::default());

        let actor = actor::ProcessActor {
            name: name.clone(),
            worker,
            streaming,
            metadata,
            config,
            mailbox,
            state: state_tx,
            stats: stats_tx,
            counters: ProcessStats::default(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            name,
            commands,
            state,
            stats,
            task,
        }
    }

    /// The process name.
    pub const fn name(&self) -> &ProcessName {
        &self.name
    }

    /// Starts or restarts the process. A no-op while starting or running.
    pub fn start(&self) -> Result<(), ProcessError> {
        self.send(Command::Start)
    }

    /// Stops consuming and releases the lock. A no-op while idle.
    pub fn pause(&self) -> Result<(), ProcessError> {
        self.send(Command::Pause)
    }

    /// The current state.
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Waits until the state satisfies `predicate` and returns that state.
    ///
    /// Returns the last state if the process ends first.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(ProcessState) -> bool,
    ) -> ProcessState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| predicate(*current)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Current counters.
    pub fn stats(&self) -> ProcessStats {
        *self.stats.borrow()
    }

    /// Waits until the counters satisfy `predicate` and returns them.
    pub async fn wait_for_stats(
        &self,
        mut predicate: impl FnMut(&ProcessStats) -> bool,
    ) -> ProcessStats {
        let mut stats = self.stats.clone();
        let reached = stats.wait_for(|current| predicate(current)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *stats.borrow())
    }

    /// Stops the process for good, releasing its lock, and waits for the task.
    pub async fn shutdown(self) {
        let (ack, acked) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = acked.await;
        }
        let _ = self.task.await;
    }

    fn send(&self, command: Command) -> Result<(), ProcessError> {
        self.commands
            .send(command)
            .map_err(|_| ProcessError::ShutDown(self.name.to_string()))
    }
}
