//! Event loop of a versioned projection.
//!
//! A projector persists its projection's version tag next to the checkpoint.
//! On every start it compares the two and either resumes, upgrades in place
//! or rebuilds from the beginning of the feed. Changes are buffered by the
//! projection and committed when it receives [`Flush`], right before the
//! checkpoint is persisted.

use crate::config::ProcessConfig;
use crate::dispatch::{
    system_event, Delivery, EventType, Flush, Handles, HandlerRegistry, RebuildFinished, Reset,
    UpgradeFrom,
};
use crate::errors::{HandlerError, MetadataResult};
use crate::metadata::{MetadataProvider, ProcessMetadata};
use crate::process::{Flow, Process, ProcessName, ProcessWorker, WorkerContext};
use crate::streaming::EventStreaming;
use crate::tracking::EventProcessTracking;
use async_trait::async_trait;
use eventline_types::{StoredEvent, Token};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a projector treats the version found in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeMode {
    /// Resume from the stored checkpoint.
    NotNeeded,
    /// Resume from the stored checkpoint after delivering [`UpgradeFrom`].
    Upgrade,
    /// Start over from `Token::Initial` after delivering [`Reset`].
    Rebuild,
}

/// A read model maintained by a projector.
pub trait Projection: Send + 'static {
    /// Version tag of the read model's current shape.
    fn version(&self) -> &str;

    /// How to treat a stored version different from [`version`](Self::version).
    ///
    /// Defaults to rebuilding.
    fn upgrade_mode(&self, _stored_version: &str) -> UpgradeMode {
        UpgradeMode::Rebuild
    }
}

/// Decides the start mode from the stored version alone.
pub fn decide_upgrade<P: Projection + ?Sized>(
    projection: &P,
    stored_version: Option<&str>,
) -> UpgradeMode {
    match stored_version {
        Some(stored) if stored == projection.version() => UpgradeMode::NotNeeded,
        Some(stored) => projection.upgrade_mode(stored),
        None => UpgradeMode::Rebuild,
    }
}

/// Builder of a process that maintains projection `P`.
///
/// Unlike a simple process, a projector stops on failures: fatal errors put
/// it in `Faulted`, concurrency conflicts in `Conflicted`.
pub struct ProjectorProcess<P> {
    name: ProcessName,
    projection: P,
    registry: HandlerRegistry<P>,
    config: ProcessConfig,
    tracking: Option<Arc<EventProcessTracking>>,
}

impl<P: Projection> ProjectorProcess<P> {
    /// Starts building projector `name` around `projection`.
    pub fn builder(name: ProcessName, projection: P) -> Self {
        Self {
            name,
            projection,
            registry: HandlerRegistry::new(),
            config: ProcessConfig::default(),
            tracking: None,
        }
    }

    /// Delivers events (or system messages) of type `E` to the projection.
    #[must_use]
    pub fn register<E>(mut self) -> Self
    where
        P: Handles<E>,
        E: EventType,
    {
        self.registry = self.registry.register::<E>();
        self
    }

    /// Replaces the process configuration.
    #[must_use]
    pub fn with_config(mut self, config: ProcessConfig) -> Self {
        self.config = config;
        self
    }

    /// Reports progress to `tracking` under the process name.
    #[must_use]
    pub fn with_tracking(mut self, tracking: Arc<EventProcessTracking>) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Spawns the projector in the `Inactive` state.
    pub fn spawn(self, streaming: EventStreaming, metadata: &dyn MetadataProvider) -> Process {
        if let Some(tracking) = &self.tracking {
            tracking.register_handler(&self.name);
        }
        let process_metadata = metadata.metadata(&self.name);
        let worker = ProjectorWorker {
            projection: self.projection,
            registry: self.registry,
            flush_threshold: self.config.flush_threshold.into(),
            tracking: self.tracking,
            pending: None,
            rebuilding: false,
            dirty: false,
            current: Token::Initial,
            saved: Token::Initial,
            since_checkpoint: 0,
        };
        Process::spawn(self.name, worker, streaming, process_metadata, self.config)
    }
}

/// System message to deliver once the projector is running.
enum Pending {
    Reset,
    UpgradeFrom(String),
}

struct ProjectorWorker<P> {
    projection: P,
    registry: HandlerRegistry<P>,
    flush_threshold: u64,
    tracking: Option<Arc<EventProcessTracking>>,
    pending: Option<Pending>,
    rebuilding: bool,
    /// The projection holds changes not yet flushed.
    dirty: bool,
    current: Token,
    saved: Token,
    since_checkpoint: u64,
}

impl<P: Projection> ProjectorWorker<P> {
    fn classify(&mut self, delivery: Delivery, cx: &mut WorkerContext<'_>) -> Flow {
        if delivery.retried {
            cx.stats.retries += 1;
        }
        match delivery.outcome {
            None => Flow::Continue,
            Some(Ok(())) => {
                self.dirty = true;
                Flow::Continue
            }
            Some(Err(HandlerError::Conflict(reason))) => Flow::Conflict(reason),
            Some(Err(HandlerError::Transient(reason) | HandlerError::Fatal(reason))) => {
                Flow::Fault(reason)
            }
        }
    }

    async fn deliver_system<M: EventType + Serialize>(
        &mut self,
        message: &M,
        cx: &mut WorkerContext<'_>,
    ) -> Flow {
        let event = match system_event(message, self.current) {
            Ok(event) => event,
            Err(error) => return Flow::Fault(error.to_string()),
        };
        let delivery = self.registry.deliver(&mut self.projection, &event).await;
        self.classify(delivery, cx)
    }

    /// Flushes buffered changes, then persists the checkpoint.
    ///
    /// Progress is reported to tracking only here: an event counts as
    /// finished once its changes are flushed.
    async fn checkpoint(&mut self, cx: &mut WorkerContext<'_>) -> Flow {
        if self.dirty {
            let flow = self.deliver_system(&Flush, cx).await;
            if flow != Flow::Continue {
                return flow;
            }
            self.dirty = false;
        }
        if let Some(tracking) = &self.tracking {
            tracking.report_progress(cx.process_name, self.current);
        }

        match cx.metadata.set_token(self.current).await {
            Ok(()) => {
                debug!(token = %self.current, "projection checkpoint saved");
                self.saved = self.current;
                self.since_checkpoint = 0;
                cx.stats.checkpoints_saved += 1;
            }
            Err(error) => warn!(%error, "failed to save projection checkpoint"),
        }
        Flow::Continue
    }
}

#[async_trait]
impl<P: Projection> ProcessWorker for ProjectorWorker<P> {
    async fn prepare(&mut self, metadata: &dyn ProcessMetadata) -> MetadataResult<Token> {
        let stored_version = metadata.get_version().await?;
        let stored_token = metadata.get_token().await?;
        let mode = decide_upgrade(&self.projection, stored_version.as_deref());
        info!(
            stored_version = stored_version.as_deref().unwrap_or("<none>"),
            version = self.projection.version(),
            ?mode,
            "starting projector"
        );

        self.dirty = false;
        self.since_checkpoint = 0;
        let token = match mode {
            UpgradeMode::NotNeeded => {
                self.pending = None;
                self.rebuilding = false;
                stored_token
            }
            UpgradeMode::Upgrade => {
                self.pending = stored_version.map(Pending::UpgradeFrom);
                self.rebuilding = false;
                stored_token
            }
            UpgradeMode::Rebuild => {
                // The version is stored after RebuildFinished, so an
                // interrupted rebuild starts over on the next run.
                metadata.set_token(Token::Initial).await?;
                self.pending = Some(Pending::Reset);
                self.rebuilding = true;
                Token::Initial
            }
        };

        self.current = token;
        self.saved = token;
        Ok(token)
    }

    async fn on_started(&mut self, cx: &mut WorkerContext<'_>) -> Flow {
        match self.pending.take() {
            None => Flow::Continue,
            Some(Pending::Reset) => self.deliver_system(&Reset, cx).await,
            Some(Pending::UpgradeFrom(version)) => {
                let flow = self.deliver_system(&UpgradeFrom { version }, cx).await;
                if flow == Flow::Continue {
                    if let Err(error) = cx.metadata.set_version(self.projection.version()).await {
                        warn!(%error, "failed to persist upgraded projection version");
                    }
                }
                flow
            }
        }
    }

    async fn on_event(&mut self, event: StoredEvent, cx: &mut WorkerContext<'_>) -> Flow {
        let delivery = self.registry.deliver(&mut self.projection, &event).await;
        let flow = self.classify(delivery, cx);
        if flow != Flow::Continue {
            return flow;
        }

        self.current = event.token;
        self.since_checkpoint += 1;
        cx.stats.events_processed += 1;

        if self.since_checkpoint >= self.flush_threshold {
            return self.checkpoint(cx).await;
        }
        Flow::Continue
    }

    async fn on_end_of_stream(&mut self, cx: &mut WorkerContext<'_>) -> Flow {
        if self.rebuilding {
            self.rebuilding = false;
            info!(token = %self.current, "projection rebuild finished");
            let flow = self.deliver_system(&RebuildFinished, cx).await;
            if flow != Flow::Continue {
                return flow;
            }
            if let Err(error) = cx.metadata.set_version(self.projection.version()).await {
                warn!(%error, "failed to persist rebuilt projection version");
            }
        }

        if self.dirty || self.current != self.saved {
            return self.checkpoint(cx).await;
        }
        Flow::Continue
    }
}
