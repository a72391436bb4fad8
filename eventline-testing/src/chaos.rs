//! Failure injection for event store consumers.

use async_trait::async_trait;
use eventline_types::{
    AppendOutcome, CancelSignal, EventStore, EventStoreError, EventStoreResult, ExpectedVersion,
    FeedPage, NewEvent, Operation, Snapshot, StreamName, StreamSlice, Token,
};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use tracing::debug;

/// Chance of an injection per call, from 0 (never) to 1 (every call).
///
/// ```ignore
/// use eventline_testing::chaos::Probability;
///
/// let coin_flip = Probability::try_new(0.5).unwrap();
/// assert!(Probability::try_new(-0.1).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        Self::try_new(value.clamp(0.0, 1.0)).unwrap_or_default()
    }
}

/// Random failure rates of a [`ChaosEventStore`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    version_conflict_probability: Probability,
}

impl ChaosConfig {
    /// A configuration with a fixed seed, so injections repeat run after run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Chance that any call fails with `EventStoreError::StoreFailure`.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Chance that an append reports a conflict without writing.
    #[must_use]
    pub fn with_version_conflict_probability(mut self, probability: f32) -> Self {
        self.version_conflict_probability = Probability::clamped(probability);
        self
    }
}

/// One call forwarded to (or intercepted by) a [`ChaosEventStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    /// The operation called.
    pub operation: Operation,
    /// The feed position requested, for feed reads.
    pub from_token: Option<Token>,
}

/// Wraps any store in a [`ChaosEventStore`].
pub trait ChaosEventStoreExt: Sized {
    /// Wraps `self` with the given failure rates.
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventStore<Self>;
}

impl<S: EventStore> ChaosEventStoreExt for S {
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventStore<Self> {
        ChaosEventStore::new(self, config)
    }
}

/// An event store that fails on purpose.
///
/// Failures come from two sources: the random rates of its [`ChaosConfig`]
/// and failures scripted with [`fail_next`](Self::fail_next). Every call is
/// logged, injected or not.
pub struct ChaosEventStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    scripted: Mutex<HashMap<Operation, u32>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl<S> ChaosEventStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    /// Makes the next `count` calls of `operation` fail.
    pub fn fail_next(&self, operation: Operation, count: u32) {
        let _ = self.scripted.lock().insert(operation, count);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of `operation` received so far.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let value: f32 = probability.into();

        if value <= 0.0 {
            return false;
        }

        if value >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(value))
    }

    /// Logs the call and decides whether it fails.
    fn intercept(&self, operation: Operation, from_token: Option<Token>) -> EventStoreResult<()> {
        self.calls.lock().push(StoreCall {
            operation,
            from_token,
        });

        let scripted = {
            let mut scripted = self.scripted.lock();
            match scripted.get_mut(&operation) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        if scripted || self.should_inject(self.config.failure_probability) {
            debug!(%operation, "injecting store failure");
            return Err(EventStoreError::StoreFailure {
                operation,
                detail: "injected failure".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S: EventStore> EventStore for ChaosEventStore<S> {
    async fn read_stream(
        &self,
        stream_name: &StreamName,
        min_version: u64,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<StreamSlice> {
        self.intercept(Operation::ReadStream, None)?;
        self.store
            .read_stream(stream_name, min_version, max_count, load_body)
            .await
    }

    async fn add_to_stream(
        &self,
        stream_name: &StreamName,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> EventStoreResult<AppendOutcome> {
        self.intercept(Operation::AddToStream, None)?;
        if self.should_inject(self.config.version_conflict_probability) {
            let current = self.store.read_stream(stream_name, 0, 0, false).await?;
            debug!(stream = %stream_name, "injecting version conflict");
            return Ok(AppendOutcome::Conflict {
                current_version: current.stream_version,
            });
        }
        self.store
            .add_to_stream(stream_name, events, expected_version)
            .await
    }

    async fn get_all_events(
        &self,
        from_token: &Token,
        max_count: usize,
        load_body: bool,
    ) -> EventStoreResult<FeedPage> {
        self.intercept(Operation::GetAllEvents, Some(*from_token))?;
        self.store
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
        self.intercept(Operation::WaitForEvents, Some(*from_token))?;
        self.store
            .wait_for_events(from_token, max_count, load_body, cancel)
            .await
    }

    async fn load_snapshot(&self, stream_name: &StreamName) -> EventStoreResult<Option<Snapshot>> {
        self.intercept(Operation::LoadSnapshot, None)?;
        self.store.load_snapshot(stream_name).await
    }

    async fn save_snapshot(
        &self,
        stream_name: &StreamName,
        snapshot: Snapshot,
    ) -> EventStoreResult<()> {
        self.intercept(Operation::SaveSnapshot, None)?;
        self.store.save_snapshot(stream_name, snapshot).await
    }
}
