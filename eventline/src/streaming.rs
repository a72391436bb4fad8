//! Cursor-style consumption of the global feed.
//!
//! An [`EventStreamer`] serves events from a prefetched batch and only touches
//! the store when the batch is drained. When a caller asks to wait, the
//! streamer long-polls the store and, if a [`NotificationBus`] is configured,
//! listens for push messages at the same time; whichever arrives first wins.

use crate::config::StreamingConfig;
use crate::dead_letter::{DeadLetter, DeadLetterLog};
use crate::process::ProcessName;
use crate::push::{Destination, NotificationBus, PushMessage};
use eventline_types::{CancelSignal, EventStore, EventStoreResult, FeedPage, StoredEvent, Token};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument, warn};

/// Factory of streamers sharing one store, bus and dead-letter log.
#[derive(Clone)]
pub struct EventStreaming {
    store: Arc<dyn EventStore>,
    bus: Option<Arc<dyn NotificationBus>>,
    dead_letters: Option<Arc<dyn DeadLetterLog>>,
    config: StreamingConfig,
}

impl EventStreaming {
    /// Creates streaming over `store` with default configuration.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            bus: None,
            dead_letters: None,
            config: StreamingConfig::default(),
        }
    }

    /// Lets waiting streamers wake on push messages from `bus`.
    #[must_use]
    pub fn with_notifications(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Records dead letters in `log`.
    #[must_use]
    pub fn with_dead_letters(mut self, log: Arc<dyn DeadLetterLog>) -> Self {
        self.dead_letters = Some(log);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: StreamingConfig) -> Self {
        self.config = config;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Creates a cursor positioned after `token` on behalf of `process_name`.
    pub fn get_streamer(&self, token: Token, process_name: ProcessName) -> EventStreamer {
        let notifications = self
            .bus
            .as_ref()
            .map(|bus| bus.subscribe(&Destination::any(process_name.clone())));

        EventStreamer {
            store: Arc::clone(&self.store),
            dead_letters: self.dead_letters.clone(),
            notifications,
            process_name,
            batch_size: self.config.batch_size.into(),
            fetch_token: token,
            delivered_token: token,
            batch: VecDeque::new(),
            last_delivered: None,
            cancel: CancelSignal::new(),
        }
    }
}

impl std::fmt::Debug for EventStreaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreaming")
            .field("push_enabled", &self.bus.is_some())
            .field("dead_letters_enabled", &self.dead_letters.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A cursor over the global feed owned by one consumer.
///
/// Dropping the streamer disposes it.
pub struct EventStreamer {
    store: Arc<dyn EventStore>,
    dead_letters: Option<Arc<dyn DeadLetterLog>>,
    notifications: Option<broadcast::Receiver<PushMessage>>,
    process_name: ProcessName,
    batch_size: usize,
    /// Token the next store read starts after.
    fetch_token: Token,
    /// Token of the last event handed out.
    delivered_token: Token,
    batch: VecDeque<StoredEvent>,
    last_delivered: Option<StoredEvent>,
    cancel: CancelSignal,
}

enum Woken {
    Page(FeedPage),
    Pushed(StoredEvent),
    Reread,
}

impl EventStreamer {
    /// Returns the next event, or `None` when none is available.
    ///
    /// With `without_waiting` a drained batch is refilled by a single store
    /// read. Otherwise the call suspends until an event arrives, a push message
    /// wakes it, or the streamer is disposed.
    ///
    /// A store error leaves the cursor where it was; calling again retries the
    /// same read.
    #[instrument(skip(self), fields(process = %self.process_name))]
    pub async fn next_event(
        &mut self,
        without_waiting: bool,
    ) -> EventStoreResult<Option<StoredEvent>> {
        if self.is_disposed() {
            return Ok(None);
        }

        if self.batch.is_empty() {
            if without_waiting {
                self.load().await?;
            } else {
                self.load_waiting().await?;
            }
        }

        let Some(event) = self.batch.pop_front() else {
            return Ok(None);
        };
        self.delivered_token = event.token;
        self.last_delivered = Some(event.clone());
        Ok(Some(event))
    }

    /// Token of the last delivered event (the starting token before any delivery).
    pub const fn token(&self) -> Token {
        self.delivered_token
    }

    /// The process this streamer reads for.
    pub const fn process_name(&self) -> &ProcessName {
        &self.process_name
    }

    /// Records the most recently delivered event as permanently skipped.
    ///
    /// Never fails: problems with the dead-letter log are logged and dropped.
    #[instrument(skip(self), fields(process = %self.process_name))]
    pub async fn mark_as_dead_letter(&mut self) {
        let Some(event) = self.last_delivered.clone() else {
            warn!("dead letter requested before any event was delivered");
            return;
        };
        warn!(token = %event.token, event_type = %event.event_type, "dead-lettering event");

        let Some(log) = &self.dead_letters else {
            return;
        };
        if let Err(error) = log
            .record(DeadLetter::new(self.process_name.clone(), event))
            .await
        {
            warn!(%error, "failed to record dead letter");
        }
    }

    /// Cancels any outstanding wait and stops delivering events.
    pub fn dispose(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!(process = %self.process_name, "disposing streamer");
        }
        self.cancel.cancel();
        self.batch.clear();
        self.notifications = None;
    }

    /// True once disposed, either directly or through its cancel signal.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal that disposes the streamer when fired from elsewhere.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    async fn load(&mut self) -> EventStoreResult<()> {
        let page = self
            .store
            .get_all_events(&self.fetch_token, self.batch_size, true)
            .await?;
        self.accept(page);
        Ok(())
    }

    async fn load_waiting(&mut self) -> EventStoreResult<()> {
        let woken = wait_for_next(
            self.store.as_ref(),
            self.fetch_token,
            self.batch_size,
            &self.cancel,
            self.notifications.as_mut(),
        )
        .await?;

        match woken {
            Woken::Page(page) => self.accept(page),
            Woken::Pushed(event) => {
                debug!(token = %event.token, "delivering pushed event");
                self.fetch_token = event.token;
                self.batch.push_back(event);
            }
            Woken::Reread => self.load().await?,
        }
        Ok(())
    }

    fn accept(&mut self, page: FeedPage) {
        debug!(
            from = %self.fetch_token,
            next = %page.next_token,
            count = page.len(),
            "loaded batch"
        );
        self.fetch_token = page.next_token;
        self.batch.extend(page.events);
    }
}

impl Drop for EventStreamer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for EventStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamer")
            .field("process_name", &self.process_name)
            .field("token", &self.delivered_token)
            .field("buffered", &self.batch.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Races a store long-poll against push messages.
///
/// A pushed event directly after `from` is returned as is. Any other newer
/// message only proves that something was committed, so the caller rereads the
/// store instead of risking a gap.
async fn wait_for_next(
    store: &dyn EventStore,
    from: Token,
    batch_size: usize,
    cancel: &CancelSignal,
    notifications: Option<&mut broadcast::Receiver<PushMessage>>,
) -> EventStoreResult<Woken> {
    let wait = store.wait_for_events(&from, batch_size, true, cancel);
    tokio::pin!(wait);

    let Some(notifications) = notifications else {
        return wait.await.map(Woken::Page);
    };

    loop {
        let received = tokio::select! {
            page = &mut wait => return page.map(Woken::Page),
            received = notifications.recv() => received,
        };

        match received {
            Ok(message) => match message.to_event() {
                Ok(event) if event.token <= from => {}
                Ok(event) if event.token.is_successor_of(from) => return Ok(Woken::Pushed(event)),
                Ok(_) => return Ok(Woken::Reread),
                Err(error) => warn!(%error, "ignoring malformed push message"),
            },
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "push subscription lagged");
                return Ok(Woken::Reread);
            }
            Err(RecvError::Closed) => return wait.await.map(Woken::Page),
        }
    }
}
