//! Behavioral contract of [`EventStore`] backends.
//!
//! Each `test_*` function runs one scenario against a store built by
//! `make_store` and reports the first violated expectation. Stream names are
//! unique per run and feed assertions are relative to the head observed at
//! the start of the scenario, so backends shared between tests can run the
//! suite too.

use eventline_types::{
    AppendOutcome, CancelSignal, EventStore, EventStoreError, ExpectedVersion, FeedPage, NewEvent,
    Snapshot, StreamName, Token,
};
use std::time::Duration;
use uuid::Uuid;

/// A violated expectation of the contract.
#[derive(thiserror::Error, Debug)]
#[error("[{scenario}] {detail}")]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(
        scenario: &'static str,
        operation: &'static str,
        error: EventStoreError,
    ) -> Self {
        Self::new(
            scenario,
            format!("{operation} failed unexpectedly: {error}"),
        )
    }
}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_stream(
    scenario: &'static str,
    label: &str,
) -> Result<StreamName, ContractTestFailure> {
    let raw = format!("contract-{scenario}-{label}-{}", Uuid::now_v7());
    StreamName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::new(scenario, format!("unable to build stream `{raw}`: {error}"))
    })
}

fn contract_event(n: usize) -> NewEvent {
    NewEvent::new("ContractTestEvent", "json", format!(r#"{{"n":{n}}}"#))
}

fn contract_events(count: usize) -> Vec<NewEvent> {
    (1..=count).map(contract_event).collect()
}

fn ensure(
    scenario: &'static str,
    condition: bool,
    detail: impl FnOnce() -> String,
) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::new(scenario, detail()))
    }
}

async fn append<S: EventStore>(
    scenario: &'static str,
    store: &S,
    stream: &StreamName,
    events: Vec<NewEvent>,
    expected_version: ExpectedVersion,
) -> Result<AppendOutcome, ContractTestFailure> {
    store
        .add_to_stream(stream, events, expected_version)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "add_to_stream", error))
}

async fn head<S: EventStore>(
    scenario: &'static str,
    store: &S,
) -> Result<Token, ContractTestFailure> {
    store
        .get_all_events(&Token::Current, 1, false)
        .await
        .map(|page| page.next_token)
        .map_err(|error| ContractTestFailure::store_error(scenario, "get_all_events", error))
}

async fn feed<S: EventStore>(
    scenario: &'static str,
    store: &S,
    from: Token,
    max_count: usize,
    load_body: bool,
) -> Result<FeedPage, ContractTestFailure> {
    store
        .get_all_events(&from, max_count, load_body)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "get_all_events", error))
}

async fn load_snapshot<S: EventStore>(
    scenario: &'static str,
    store: &S,
    stream: &StreamName,
) -> Result<Option<Snapshot>, ContractTestFailure> {
    store
        .load_snapshot(stream)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "load_snapshot", error))
}

/// A stream that was never written reads as version 0 with no events.
pub async fn test_missing_stream_reads<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "missing_stream_reads";

    let store = make_store();
    let stream = contract_stream(SCENARIO, "absent")?;

    let slice = store
        .read_stream(&stream, 0, 100, true)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", error))?;

    ensure(SCENARIO, slice.stream_version == 0 && slice.events.is_empty(), || {
        format!(
            "expected an empty version-0 slice, got version {} with {} events",
            slice.stream_version,
            slice.events.len()
        )
    })
}

/// Appends number stream versions from 1 and receive increasing tokens.
pub async fn test_sequential_versions<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "sequential_versions";

    let store = make_store();
    let stream = contract_stream(SCENARIO, "ledger")?;

    let outcome = append(SCENARIO, &store, &stream, contract_events(3), ExpectedVersion::NEW).await?;
    let AppendOutcome::Committed {
        stream_version,
        tokens,
    } = outcome.clone()
    else {
        return Err(ContractTestFailure::new(
            SCENARIO,
            format!("append to a new stream did not commit: {outcome:?}"),
        ));
    };
    ensure(SCENARIO, stream_version == 3 && tokens.len() == 3, || {
        format!("expected version 3 and 3 tokens, got {stream_version} and {tokens:?}")
    })?;
    ensure(
        SCENARIO,
        tokens.windows(2).all(|pair| pair[0] < pair[1]),
        || format!("tokens are not strictly increasing: {tokens:?}"),
    )?;

    let slice = store
        .read_stream(&stream, 2, 100, true)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", error))?;
    let versions: Vec<u64> = slice.events.iter().map(|event| event.stream_version).collect();
    ensure(SCENARIO, versions == [2, 3], || {
        format!("reading from version 2 returned versions {versions:?}")
    })?;

    let outcome = append(SCENARIO, &store, &stream, contract_events(1), ExpectedVersion::At(3)).await?;
    ensure(
        SCENARIO,
        matches!(outcome, AppendOutcome::Committed { stream_version: 4, .. }),
        || format!("append at the current version did not commit as version 4: {outcome:?}"),
    )
}

/// A failed version check reports the current version and writes nothing.
pub async fn test_conflict_preserves_atomicity<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "conflict_preserves_atomicity";

    let store = make_store();
    let stream = contract_stream(SCENARIO, "guarded")?;

    let _ = append(SCENARIO, &store, &stream, contract_events(1), ExpectedVersion::NEW).await?;
    let before = head(SCENARIO, &store).await?;

    let outcome = append(SCENARIO, &store, &stream, contract_events(2), ExpectedVersion::NEW).await?;
    ensure(
        SCENARIO,
        outcome == AppendOutcome::Conflict { current_version: 1 },
        || format!("expected a conflict at version 1, got {outcome:?}"),
    )?;

    let slice = store
        .read_stream(&stream, 0, 100, true)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", error))?;
    ensure(SCENARIO, slice.events.len() == 1, || {
        format!("conflicting append left {} events in the stream", slice.events.len())
    })?;

    let after = head(SCENARIO, &store).await?;
    ensure(SCENARIO, before == after, || {
        format!("conflicting append moved the feed head from {before} to {after}")
    })
}

/// Writes to one stream never show up in another.
pub async fn test_stream_isolation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "stream_isolation";

    let store = make_store();
    let left = contract_stream(SCENARIO, "left")?;
    let right = contract_stream(SCENARIO, "right")?;

    let _ = append(SCENARIO, &store, &left, contract_events(2), ExpectedVersion::NEW).await?;
    let outcome = append(SCENARIO, &store, &right, contract_events(1), ExpectedVersion::NEW).await?;
    ensure(
        SCENARIO,
        matches!(outcome, AppendOutcome::Committed { stream_version: 1, .. }),
        || format!("first append to a second stream was not version 1: {outcome:?}"),
    )?;

    let slice = store
        .read_stream(&right, 0, 100, true)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "read_stream", error))?;
    ensure(
        SCENARIO,
        slice.events.len() == 1
            && slice
                .events
                .iter()
                .all(|event| event.stream_name.as_ref() == Some(&right)),
        || format!("stream `{right}` returned foreign events: {:?}", slice.events),
    )
}

/// The feed can be read in pages, each resuming from the previous `next_token`.
pub async fn test_feed_resumes_from_token<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "feed_resumes_from_token";

    let store = make_store();
    let start = head(SCENARIO, &store).await?;
    let first = contract_stream(SCENARIO, "first")?;
    let second = contract_stream(SCENARIO, "second")?;

    let mut committed = Vec::new();
    for (stream, count) in [(&first, 3), (&second, 2)] {
        let outcome = append(SCENARIO, &store, stream, contract_events(count), ExpectedVersion::Any).await?;
        committed.extend_from_slice(outcome.tokens());
    }

    let page = feed(SCENARIO, &store, start, 3, true).await?;
    let rest = feed(SCENARIO, &store, page.next_token, 100, true).await?;
    let read: Vec<Token> = page
        .events
        .iter()
        .chain(rest.events.iter())
        .map(|event| event.token)
        .filter(|token| committed.contains(token))
        .collect();
    ensure(SCENARIO, page.len() == 3 && read == committed, || {
        format!("paging returned {read:?}, expected {committed:?}")
    })?;

    let end = feed(SCENARIO, &store, rest.next_token, 100, true).await?;
    ensure(
        SCENARIO,
        end.is_empty() && end.next_token == rest.next_token,
        || format!("reading past the end moved to {} with {} events", end.next_token, end.len()),
    )
}

/// Reads without bodies keep metadata and drop payloads.
pub async fn test_reads_without_body<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "reads_without_body";

    let store = make_store();
    let start = head(SCENARIO, &store).await?;
    let stream = contract_stream(SCENARIO, "bodiless")?;
    let _ = append(SCENARIO, &store, &stream, contract_events(1), ExpectedVersion::Any).await?;

    let page = feed(SCENARIO, &store, start, 100, false).await?;
    let event = page
        .events
        .iter()
        .find(|event| event.stream_name.as_ref() == Some(&stream))
        .ok_or_else(|| ContractTestFailure::new(SCENARIO, "committed event missing from feed"))?;
    ensure(
        SCENARIO,
        event.body.is_none() && event.event_type == "ContractTestEvent",
        || format!("expected type without body, got {event:?}"),
    )
}

/// A long-poll returns as soon as an event is committed after its token.
pub async fn test_wait_wakes_on_append<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "wait_wakes_on_append";

    let store = make_store();
    let start = head(SCENARIO, &store).await?;
    let stream = contract_stream(SCENARIO, "awaited")?;
    let cancel = CancelSignal::new();

    let waiting = store.wait_for_events(&start, 10, true, &cancel);
    let appending = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        append(SCENARIO, &store, &stream, contract_events(1), ExpectedVersion::Any).await
    };
    let joined = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(waiting, appending)
    })
    .await
    .map_err(|_| ContractTestFailure::new(SCENARIO, "waiter was not woken by the append"))?;

    let (page, outcome) = joined;
    let outcome = outcome?;
    let page = page
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "wait_for_events", error))?;
    ensure(
        SCENARIO,
        page.events.iter().any(|event| outcome.tokens().contains(&event.token)),
        || format!("woken page {page:?} does not contain the committed event"),
    )
}

/// Cancelling a long-poll yields an empty page at the requested token.
pub async fn test_wait_cancellation<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "wait_cancellation";

    let store = make_store();
    let start = head(SCENARIO, &store).await?;
    let cancel = CancelSignal::new();

    let waiting = store.wait_for_events(&start, 10, true, &cancel);
    let cancelling = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    };
    let (page, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(waiting, cancelling)
    })
    .await
    .map_err(|_| ContractTestFailure::new(SCENARIO, "cancelled wait did not return"))?;

    let page = page
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "wait_for_events", error))?;
    ensure(
        SCENARIO,
        page.is_empty() && page.next_token == start,
        || format!("cancelled wait returned {page:?}, expected an empty page at {start}"),
    )
}

/// Snapshots load back as saved and a second save replaces the first.
pub async fn test_snapshot_round_trip<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S,
    S: EventStore,
{
    const SCENARIO: &str = "snapshot_round_trip";

    let store = make_store();
    let stream = contract_stream(SCENARIO, "snapshotted")?;
    let missing = load_snapshot(SCENARIO, &store, &stream).await?;
    ensure(SCENARIO, missing.is_none(), || {
        format!("fresh stream already has a snapshot: {missing:?}")
    })?;

    for body in [r#"{"total":1}"#, r#"{"total":2}"#] {
        let snapshot = Snapshot {
            snapshot_type: "Totals".to_owned(),
            format: "json".to_owned(),
            body: body.to_owned(),
            stream_name: stream.clone(),
        };
        store
            .save_snapshot(&stream, snapshot)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "save_snapshot", error))?;
    }

    let loaded = load_snapshot(SCENARIO, &store, &stream).await?;
    ensure(
        SCENARIO,
        loaded
            .as_ref()
            .is_some_and(|snapshot| snapshot.body == r#"{"total":2}"# && snapshot.stream_name == stream),
        || format!("expected the second snapshot, loaded {loaded:?}"),
    )
}

/// Generates one test per contract scenario for a store factory.
///
/// ```ignore
/// eventline_testing::event_store_contract_tests! {
///     suite = in_memory,
///     make_store = eventline_memory::InMemoryEventStore::new,
/// }
/// ```
#[macro_export]
macro_rules! event_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_conflict_preserves_atomicity, test_feed_resumes_from_token,
                test_missing_stream_reads, test_reads_without_body, test_sequential_versions,
                test_snapshot_round_trip, test_stream_isolation, test_wait_cancellation,
                test_wait_wakes_on_append,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_stream_reads_contract() {
                test_missing_stream_reads($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn sequential_versions_contract() {
                test_sequential_versions($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn conflict_preserves_atomicity_contract() {
                test_conflict_preserves_atomicity($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stream_isolation_contract() {
                test_stream_isolation($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn feed_resumes_from_token_contract() {
                test_feed_resumes_from_token($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn reads_without_body_contract() {
                test_reads_without_body($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn wait_wakes_on_append_contract() {
                test_wait_wakes_on_append($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn wait_cancellation_contract() {
                test_wait_cancellation($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn snapshot_round_trip_contract() {
                test_snapshot_round_trip($make_store)
                    .await
                    .expect("event store contract failed");
            }
        }
    };
}

pub use event_store_contract_tests;
