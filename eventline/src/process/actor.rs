use super::{Command, Flow, ProcessName, ProcessState, ProcessStats, ProcessWorker, WorkerContext};
use crate::config::ProcessConfig;
use crate::metadata::{LockState, ProcessMetadata};
use crate::streaming::{EventStreamer, EventStreaming};
use eventline_types::{EventStoreResult, StoredEvent, Token};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, instrument, warn};

type Ack = Option<oneshot::Sender<()>>;

/// The task behind a [`Process`](super::Process) handle.
pub(super) struct ProcessActor<W> {
    pub(super) name: ProcessName,
    pub(super) worker: W,
    pub(super) streaming: EventStreaming,
    pub(super) metadata: Arc<dyn ProcessMetadata>,
    pub(super) config: ProcessConfig,
    pub(super) mailbox: mpsc::UnboundedReceiver<Command>,
    pub(super) state: watch::Sender<ProcessState>,
    pub(super) stats: watch::Sender<ProcessStats>,
    pub(super) counters: ProcessStats,
}

enum Exit {
    Idle,
    Shutdown(Ack),
}

enum Acquire {
    Locked,
    Cancelled,
    Failed(crate::errors::MetadataError),
    Shutdown(Ack),
}

enum RunExit {
    Paused,
    Faulted(String),
    Conflicted(String),
    LockLost,
    Shutdown(Ack),
}

enum Wake {
    Command(Option<Command>),
    LockChanged(bool),
    Event(EventStoreResult<Option<StoredEvent>>),
}

impl<W: ProcessWorker> ProcessActor<W> {
    #[instrument(skip_all, fields(process = %self.name))]
    pub(super) async fn run(mut self) {
        info!("process spawned");
        let ack = loop {
            match self.mailbox.recv().await {
                Some(Command::Start) => {
                    if let Exit::Shutdown(ack) = self.start().await {
                        break ack;
                    }
                }
                Some(Command::Pause) => {}
                Some(Command::Shutdown(ack)) => break Some(ack),
                None => break None,
            }
        };

        self.set_state(ProcessState::Stopping);
        release_lock(self.metadata.as_ref()).await;
        info!("process stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn start(&mut self) -> Exit {
        loop {
            self.set_state(ProcessState::Starting);
            let metadata = Arc::clone(&self.metadata);

            match self.acquire_lock(metadata.as_ref()).await {
                Acquire::Locked => {}
                Acquire::Cancelled => {
                    release_lock(self.metadata.as_ref()).await;
                    self.set_state(ProcessState::Inactive);
                    return Exit::Idle;
                }
                Acquire::Failed(error) => {
                    warn!(%error, "lock acquisition failed");
                    release_lock(self.metadata.as_ref()).await;
                    self.set_state(ProcessState::Inactive);
                    return Exit::Idle;
                }
                Acquire::Shutdown(ack) => return Exit::Shutdown(ack),
            }

            let token = match self.worker.prepare(metadata.as_ref()).await {
                Ok(token) => token,
                Err(error) => {
                    warn!(%error, "metadata unavailable while starting");
                    release_lock(self.metadata.as_ref()).await;
                    self.set_state(ProcessState::Inactive);
                    return Exit::Idle;
                }
            };

            match self.run_locked(token, metadata.as_ref()).await {
                RunExit::Paused => {
                    self.set_state(ProcessState::Pausing);
                    release_lock(self.metadata.as_ref()).await;
                    self.set_state(ProcessState::Inactive);
                    return Exit::Idle;
                }
                RunExit::Faulted(reason) => {
                    error!(%reason, "process faulted");
                    release_lock(self.metadata.as_ref()).await;
                    self.set_state(ProcessState::Faulted);
                    return Exit::Idle;
                }
                RunExit::Conflicted(reason) => {
                    error!(%reason, "process stopped on a concurrency conflict");
                    release_lock(self.metadata.as_ref()).await;
                    self.set_state(ProcessState::Conflicted);
                    return Exit::Idle;
                }
                RunExit::LockLost => {
                    warn!("process lock lost; reacquiring");
                }
                RunExit::Shutdown(ack) => return Exit::Shutdown(ack),
            }
        }
    }

    async fn acquire_lock(&mut self, metadata: &dyn ProcessMetadata) -> Acquire {
        let lock = metadata.wait_for_lock();
        tokio::pin!(lock);

        loop {
            let command = tokio::select! {
                biased;
                command = self.mailbox.recv() => command,
                acquired = &mut lock => {
                    return match acquired {
                        Ok(()) => Acquire::Locked,
                        Err(error) => Acquire::Failed(error),
                    };
                }
            };

            match command {
                Some(Command::Start) => {}
                Some(Command::Pause) => return Acquire::Cancelled,
                Some(Command::Shutdown(ack)) => return Acquire::Shutdown(Some(ack)),
                None => return Acquire::Shutdown(None),
            }
        }
    }

    async fn run_locked(&mut self, token: Token, metadata: &dyn ProcessMetadata) -> RunExit {
        self.set_state(ProcessState::Running);
        let mut streamer = self.streaming.get_streamer(token, self.name.clone());
        let mut lock_state = metadata.lock_state();

        let exit = self.consume(&mut streamer, &mut lock_state, metadata).await;

        streamer.dispose();
        self.publish_stats();
        exit
    }

    async fn consume(
        &mut self,
        streamer: &mut EventStreamer,
        lock_state: &mut watch::Receiver<LockState>,
        metadata: &dyn ProcessMetadata,
    ) -> RunExit {
        if *lock_state.borrow_and_update() != LockState::Locked {
            return RunExit::LockLost;
        }

        let mut cx = WorkerContext {
            process_name: &self.name,
            streamer: &mut *streamer,
            metadata,
            stats: &mut self.counters,
        };
        let flow = self.worker.on_started(&mut cx).await;
        if let Some(exit) = exit_for(flow) {
            return exit;
        }

        let mut at_end = false;
        loop {
            let wake = tokio::select! {
                biased;
                command = self.mailbox.recv() => Wake::Command(command),
                changed = lock_state.changed() => Wake::LockChanged(changed.is_ok()),
                next = streamer.next_event(!at_end) => Wake::Event(next),
            };

            let flow = match wake {
                Wake::Command(Some(Command::Start)) => continue,
                Wake::Command(Some(Command::Pause)) => return RunExit::Paused,
                Wake::Command(Some(Command::Shutdown(ack))) => return RunExit::Shutdown(Some(ack)),
                Wake::Command(None) => return RunExit::Shutdown(None),
                Wake::LockChanged(open) => {
                    if !open || *lock_state.borrow_and_update() != LockState::Locked {
                        return RunExit::LockLost;
                    }
                    continue;
                }
                Wake::Event(Ok(Some(event))) => {
                    at_end = false;
                    let mut cx = WorkerContext {
                        process_name: &self.name,
                        streamer: &mut *streamer,
                        metadata,
                        stats: &mut self.counters,
                    };
                    self.worker.on_event(event, &mut cx).await
                }
                // A wake-up that produced nothing; keep waiting.
                Wake::Event(Ok(None)) if at_end => continue,
                Wake::Event(Ok(None)) => {
                    at_end = true;
                    let mut cx = WorkerContext {
                        process_name: &self.name,
                        streamer: &mut *streamer,
                        metadata,
                        stats: &mut self.counters,
                    };
                    self.worker.on_end_of_stream(&mut cx).await
                }
                Wake::Event(Err(error)) => {
                    warn!(%error, token = %streamer.token(), "event store read failed; retrying");
                    if let Some(exit) = self.back_off().await {
                        return exit;
                    }
                    continue;
                }
            };

            self.publish_stats();
            if let Some(exit) = exit_for(flow) {
                return exit;
            }
        }
    }

    /// Sleeps for the retry delay unless a command arrives first.
    async fn back_off(&mut self) -> Option<RunExit> {
        let delay = self.config.error_retry_delay.as_duration();
        let command = tokio::select! {
            biased;
            command = self.mailbox.recv() => command,
            () = tokio::time::sleep(delay) => return None,
        };

        match command {
            Some(Command::Start) => None,
            Some(Command::Pause) => Some(RunExit::Paused),
            Some(Command::Shutdown(ack)) => Some(RunExit::Shutdown(Some(ack))),
            None => Some(RunExit::Shutdown(None)),
        }
    }

    fn set_state(&self, next: ProcessState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "process state changed");
        }
    }

    fn publish_stats(&self) {
        let _ = self.stats.send_replace(self.counters);
    }
}

async fn release_lock(metadata: &dyn ProcessMetadata) {
    if let Err(error) = metadata.unlock().await {
        warn!(%error, "failed to release process lock");
    }
}

fn exit_for(flow: Flow) -> Option<RunExit> {
    match flow {
        Flow::Continue => None,
        Flow::Fault(reason) => Some(RunExit::Faulted(reason)),
        Flow::Conflict(reason) => Some(RunExit::Conflicted(reason)),
    }
}
