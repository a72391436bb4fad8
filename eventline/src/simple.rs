//! Event loop of a simple process: handle, dead-letter, checkpoint.

use crate::config::ProcessConfig;
use crate::dispatch::{EventType, Handles, HandlerRegistry};
use crate::errors::MetadataResult;
use crate::metadata::{MetadataProvider, ProcessMetadata};
use crate::process::{Flow, Process, ProcessName, ProcessWorker, WorkerContext};
use crate::streaming::EventStreaming;
use crate::tracking::EventProcessTracking;
use async_trait::async_trait;
use eventline_types::{StoredEvent, Token};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builder of a process that feeds every event to a handler value `S`.
///
/// Handler failures never stop a simple process: after the transient retry a
/// failed event is dead-lettered and consumption continues.
pub struct SimpleProcess<S> {
    name: ProcessName,
    handler: S,
    registry: HandlerRegistry<S>,
    config: ProcessConfig,
    tracking: Option<Arc<EventProcessTracking>>,
}

impl<S: Send + 'static> SimpleProcess<S> {
    /// Starts building process `name` around `handler`.
    pub fn builder(name: ProcessName, handler: S) -> Self {
        Self {
            name,
            handler,
            registry: HandlerRegistry::new(),
            config: ProcessConfig::default(),
            tracking: None,
        }
    }

    /// Delivers events of type `E` to the handler.
    #[must_use]
    pub fn register<E>(mut self) -> Self
    where
        S: Handles<E>,
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

    /// Spawns the process in the `Inactive` state.
    pub fn spawn(self, streaming: EventStreaming, metadata: &dyn MetadataProvider) -> Process {
        if let Some(tracking) = &self.tracking {
            tracking.register_handler(&self.name);
        }
        let process_metadata = metadata.metadata(&self.name);
        let worker = SimpleWorker {
            handler: self.handler,
            registry: self.registry,
            flush_threshold: self.config.flush_threshold.into(),
            tracking: self.tracking,
            current: Token::Initial,
            saved: Token::Initial,
            since_checkpoint: 0,
        };
        Process::spawn(self.name, worker, streaming, process_metadata, self.config)
    }
}

struct SimpleWorker<S> {
    handler: S,
    registry: HandlerRegistry<S>,
    flush_threshold: u64,
    tracking: Option<Arc<EventProcessTracking>>,
    current: Token,
    saved: Token,
    since_checkpoint: u64,
}

impl<S: Send> SimpleWorker<S> {
    async fn checkpoint(&mut self, cx: &mut WorkerContext<'_>) {
        match cx.metadata.set_token(self.current).await {
            Ok(()) => {
                debug!(process = %cx.process_name, token = %self.current, "checkpoint saved");
                self.saved = self.current;
                self.since_checkpoint = 0;
                cx.stats.checkpoints_saved += 1;
            }
            Err(error) => {
                warn!(process = %cx.process_name, %error, "failed to save checkpoint");
            }
        }
    }
}

#[async_trait]
impl<S: Send + 'static> ProcessWorker for SimpleWorker<S> {
    async fn prepare(&mut self, metadata: &dyn ProcessMetadata) -> MetadataResult<Token> {
        let token = metadata.get_token().await?;
        info!(%token, "resuming simple process");
        self.current = token;
        self.saved = token;
        self.since_checkpoint = 0;
        Ok(token)
    }

    async fn on_event(&mut self, event: StoredEvent, cx: &mut WorkerContext<'_>) -> Flow {
        let delivery = self.registry.deliver(&mut self.handler, &event).await;
        if delivery.retried {
            cx.stats.retries += 1;
        }
        if let Some(Err(error)) = delivery.outcome {
            warn!(process = %cx.process_name, token = %event.token, %error, "handler failed");
            cx.streamer.mark_as_dead_letter().await;
            cx.stats.dead_letters += 1;
        }

        self.current = event.token;
        self.since_checkpoint += 1;
        cx.stats.events_processed += 1;
        if let Some(tracking) = &self.tracking {
            tracking.report_progress(cx.process_name, event.token);
        }

        if self.since_checkpoint >= self.flush_threshold {
            self.checkpoint(cx).await;
        }
        Flow::Continue
    }

    async fn on_end_of_stream(&mut self, cx: &mut WorkerContext<'_>) -> Flow {
        if self.current != self.saved {
            self.checkpoint(cx).await;
        }
        Flow::Continue
    }
}
