//! "Wait until processed" consistency across processes.
//!
//! A producer collects the tokens of the events it committed in a
//! [`TrackerSource`], commits it and hands the [`TrackingId`] to whoever needs
//! to wait. Every tracked handler reports the tokens it has finished; a
//! tracker is finished once each handler known at commit time has reported a
//! token at or past the tracker's target.

use crate::config::TrackingConfig;
use eventline_types::Token;
use nutype::nutype;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Identifier of a committed tracker.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct TrackingId(Uuid);

impl TrackingId {
    /// A fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Tokens accumulated by a producer before committing a tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSource {
    target: Option<Token>,
}

impl TrackerSource {
    /// Adds one committed token.
    pub fn add_token(&mut self, token: Token) {
        self.target = Some(self.target.map_or(token, |target| target.max(token)));
    }

    /// Adds several committed tokens.
    pub fn add_tokens<'a>(&mut self, tokens: impl IntoIterator<Item = &'a Token>) {
        for token in tokens {
            self.add_token(*token);
        }
    }

    /// The highest token added so far.
    pub const fn target(&self) -> Option<Token> {
        self.target
    }
}

#[derive(Debug, Clone)]
struct TrackItem {
    target: Token,
    handlers: Arc<[String]>,
    committed_at: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    progress: BTreeMap<String, Token>,
    trackers: HashMap<TrackingId, TrackItem>,
    stopped: bool,
}

impl Registry {
    fn is_finished(&self, item: &TrackItem) -> bool {
        item.handlers.iter().all(|handler| {
            self.progress
                .get(handler)
                .is_some_and(|reported| *reported >= item.target)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Finished,
    Pending,
    Stopped,
}

/// Coordinator of trackers and handler progress.
#[derive(Debug)]
pub struct EventProcessTracking {
    registry: Mutex<Registry>,
    changes: watch::Sender<u64>,
    config: TrackingConfig,
}

impl EventProcessTracking {
    /// Creates a coordinator.
    pub fn new(config: TrackingConfig) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            changes,
            config,
        })
    }

    /// Starts collecting tokens for a new tracker.
    pub fn create_tracker(&self) -> TrackerSource {
        TrackerSource::default()
    }

    /// Publishes `source` and returns its identifier.
    ///
    /// The tracker waits for the handlers registered at this moment. Trackers
    /// older than the configured retention are purged here.
    #[instrument(skip(self))]
    pub fn commit_to_tracker(&self, source: TrackerSource) -> TrackingId {
        let id = TrackingId::generate();
        let now = Instant::now();
        let retention = self.config.retention.as_duration();

        let mut registry = self.registry.lock();
        let before = registry.trackers.len();
        registry
            .trackers
            .retain(|_, item| now.duration_since(item.committed_at) < retention);
        let purged = before - registry.trackers.len();
        if purged > 0 {
            debug!(purged, "purged expired trackers");
        }

        let handlers: Arc<[String]> = registry.progress.keys().cloned().collect();
        let item = TrackItem {
            target: source.target.unwrap_or(Token::Initial),
            handlers,
            committed_at: now,
        };
        debug!(%id, target = %item.target, handlers = item.handlers.len(), "tracker committed");
        let _ = registry.trackers.insert(id, item);
        id
    }

    /// Starts tracking `name`. Re-registering keeps its reported progress.
    pub fn register_handler(&self, name: &str) {
        let mut registry = self.registry.lock();
        let _ = registry
            .progress
            .entry(name.to_owned())
            .or_insert(Token::Initial);
    }

    /// Records that `name` finished the event at `token`.
    ///
    /// Progress never moves backwards; unregistered handlers are ignored.
    pub fn report_progress(&self, name: &str, token: Token) {
        let advanced = {
            let mut registry = self.registry.lock();
            match registry.progress.get_mut(name) {
                Some(reported) if token > *reported => {
                    *reported = token;
                    true
                }
                _ => false,
            }
        };
        if advanced {
            self.changes.send_modify(|generation| *generation += 1);
        }
    }

    /// Looks up a committed tracker.
    pub fn find_tracker(self: &Arc<Self>, id: TrackingId) -> Option<Tracker> {
        let item = self.registry.lock().trackers.get(&id).cloned()?;
        Some(Tracker {
            tracking: Arc::clone(self),
            id,
            item,
        })
    }

    /// Fails every pending and future wait.
    pub fn stop(&self) {
        self.registry.lock().stopped = true;
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn status(&self, item: &TrackItem) -> Status {
        let registry = self.registry.lock();
        if registry.stopped {
            Status::Stopped
        } else if registry.is_finished(item) {
            Status::Finished
        } else {
            Status::Pending
        }
    }
}

/// A committed tracker, ready to be waited on.
#[derive(Debug, Clone)]
pub struct Tracker {
    tracking: Arc<EventProcessTracking>,
    id: TrackingId,
    item: TrackItem,
}

impl Tracker {
    /// The tracker's identifier.
    pub const fn id(&self) -> TrackingId {
        self.id
    }

    /// The token every tracked handler has to reach.
    pub const fn target(&self) -> Token {
        self.item.target
    }

    /// True once every tracked handler reached the target.
    pub fn is_finished(&self) -> bool {
        self.tracking.status(&self.item) == Status::Finished
    }

    /// Waits until every tracked handler reached the target.
    ///
    /// Returns `false` when `timeout` elapses first (immediately for a zero
    /// timeout) or when the coordinator is stopped.
    pub async fn wait_for_finish(&self, timeout: Duration) -> bool {
        let mut changes = self.tracking.changes.subscribe();
        match self.tracking.status(&self.item) {
            Status::Finished => return true,
            Status::Stopped => return false,
            Status::Pending if timeout.is_zero() => return false,
            Status::Pending => {}
        }

        let finished = async {
            loop {
                if changes.changed().await.is_err() {
                    return false;
                }
                match self.tracking.status(&self.item) {
                    Status::Finished => return true,
                    Status::Stopped => return false,
                    Status::Pending => {}
                }
            }
        };
        tokio::time::timeout(timeout, finished)
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerRetentionSecs;

    fn tracking() -> Arc<EventProcessTracking> {
        EventProcessTracking::new(TrackingConfig::default())
    }

    fn commit(tracking: &EventProcessTracking, tokens: &[Token]) -> TrackingId {
        let mut source = tracking.create_tracker();
        source.add_tokens(tokens);
        tracking.commit_to_tracker(source)
    }

    #[test]
    fn source_keeps_the_highest_token() {
        let mut source = TrackerSource::default();
        source.add_tokens(&[Token::Numbered(7), Token::Numbered(3), Token::Numbered(9)]);
        assert_eq!(source.target(), Some(Token::Numbered(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_answers_immediately() {
        let tracking = tracking();
        tracking.register_handler("billing");
        let id = commit(&tracking, &[Token::Numbered(4)]);
        let tracker = tracking.find_tracker(id).expect("committed");

        assert!(!tracker.wait_for_finish(Duration::ZERO).await);

        tracking.report_progress("billing", Token::Numbered(4));
        assert!(tracker.wait_for_finish(Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_wait_resolves_on_the_last_relevant_report() {
        let tracking = tracking();
        tracking.register_handler("billing");
        tracking.register_handler("shipping");
        let id = commit(&tracking, &[Token::Numbered(2), Token::Numbered(5)]);
        let tracker = tracking.find_tracker(id).expect("committed");
        let mut wait = tokio_test::task::spawn(tracker.wait_for_finish(Duration::from_secs(30)));

        tokio_test::assert_pending!(wait.poll());
        tracking.report_progress("billing", Token::Numbered(5));
        tokio_test::assert_pending!(wait.poll());
        tracking.report_progress("shipping", Token::Numbered(4));
        tokio_test::assert_pending!(wait.poll());
        tracking.report_progress("shipping", Token::Numbered(6));

        assert!(wait.is_woken());
        tokio_test::assert_ready_eq!(wait.poll(), true);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_a_handler_lags() {
        let tracking = tracking();
        tracking.register_handler("billing");
        let id = commit(&tracking, &[Token::Numbered(2)]);
        let tracker = tracking.find_tracker(id).expect("committed");

        let started = Instant::now();
        assert!(!tracker.wait_for_finish(Duration::from_secs(3)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fails_pending_and_later_waits() {
        let tracking = tracking();
        tracking.register_handler("billing");
        let id = commit(&tracking, &[Token::Numbered(2)]);
        let tracker = tracking.find_tracker(id).expect("committed");
        let mut wait = tokio_test::task::spawn(tracker.wait_for_finish(Duration::from_secs(30)));
        tokio_test::assert_pending!(wait.poll());

        tracking.stop();

        tokio_test::assert_ready_eq!(wait.poll(), false);
        tracking.report_progress("billing", Token::Numbered(2));
        assert!(!tracker.wait_for_finish(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn handlers_registered_after_commit_are_not_awaited() {
        let tracking = tracking();
        tracking.register_handler("billing");
        let id = commit(&tracking, &[Token::Numbered(1)]);
        tracking.register_handler("late");
        tracking.report_progress("billing", Token::Numbered(1));

        let tracker = tracking.find_tracker(id).expect("committed");
        assert!(tracker.is_finished());
    }

    #[tokio::test]
    async fn empty_tracker_is_finished_immediately() {
        let tracking = tracking();
        tracking.register_handler("billing");
        let id = tracking.commit_to_tracker(tracking.create_tracker());

        let tracker = tracking.find_tracker(id).expect("committed");
        assert_eq!(tracker.target(), Token::Initial);
        assert!(tracker.wait_for_finish(Duration::ZERO).await);
    }

    #[test]
    fn progress_never_regresses() {
        let tracking = tracking();
        tracking.register_handler("billing");
        tracking.report_progress("billing", Token::Numbered(8));
        tracking.report_progress("billing", Token::Numbered(3));

        let id = commit(&tracking, &[Token::Numbered(8)]);
        assert!(tracking.find_tracker(id).expect("committed").is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_trackers_are_purged_on_commit() {
        let tracking = EventProcessTracking::new(
            TrackingConfig::default()
                .with_retention(TrackerRetentionSecs::try_new(60).expect("valid retention")),
        );
        let old = commit(&tracking, &[Token::Numbered(1)]);

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = commit(&tracking, &[Token::Numbered(2)]);

        assert!(tracking.find_tracker(old).is_none());
        assert!(tracking.find_tracker(fresh).is_some());
    }
}
