mod common;

use common::{append_messages, process_name, within, Message, Recorder, World};
use eventline::{
    EventStreaming, MetadataProvider, Operation, Process, ProcessState, SimpleProcess, Token,
};
use eventline_memory::InMemoryEventStore;
use eventline_testing::chaos::{ChaosConfig, ChaosEventStoreExt};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn spawn_recorder(world: &World, name: &str, recorder: Recorder) -> Process {
    SimpleProcess::builder(process_name(name), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider)
}

/// Lets the spawned actors run until they block.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn started_process_runs_and_checkpoints() {
    // Given: Three committed events
    let world = World::new();
    let tokens = append_messages(&world.store, &["a", "b", "c"]).await;
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = spawn_recorder(&world, "mailer", recorder);
    assert_eq!(process.state(), ProcessState::Inactive);

    // When: The process is started
    process.start().expect("start");
    let state = within(process.wait_for_state(|state| state == ProcessState::Running)).await;
    let stats = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    // Then: Every event is handled and the checkpoint is the last token
    assert_eq!(state, ProcessState::Running);
    assert_eq!(stats.events_processed, 3);
    assert_eq!(journal.entries(), vec!["a", "b", "c"]);
    assert_eq!(world.provider.stored_token(&process_name("mailer")), tokens[2]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pause_while_waiting_for_the_lock_returns_to_inactive() {
    // Given: Another node holds the lock
    let world = World::new();
    let name = process_name("mailer");
    let holder = world.provider.metadata(&name);
    holder.wait_for_lock().await.expect("lock");
    let process = spawn_recorder(&world, "mailer", Recorder::default());

    // When: The process is started and paused before it gets the lock
    process.start().expect("start");
    let _ = within(process.wait_for_state(|state| state == ProcessState::Starting)).await;
    process.pause().expect("pause");
    let state = within(process.wait_for_state(|state| state == ProcessState::Inactive)).await;

    // Then: It stays out of the way once the lock is released
    holder.unlock().await.expect("unlock");
    settle().await;
    assert_eq!(state, ProcessState::Inactive);
    assert_eq!(process.state(), ProcessState::Inactive);
    let other = world.provider.metadata(&name);
    within(other.wait_for_lock()).await.expect("lock is free");
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn metadata_failure_while_starting_returns_to_inactive() {
    // Given: Metadata that fails once
    let world = World::new();
    let name = process_name("mailer");
    let _ = append_messages(&world.store, &["a"]).await;
    world.provider.fail_next(&name, 1);
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = spawn_recorder(&world, "mailer", recorder);

    // When: The process is started
    process.start().expect("start");
    settle().await;

    // Then: It gives up, and a later start succeeds
    assert_eq!(process.state(), ProcessState::Inactive);
    assert!(journal.entries().is_empty());

    process.start().expect("start");
    let _ = within(process.wait_for_state(|state| state == ProcessState::Running)).await;
    let _ = within(process.wait_for_stats(|stats| stats.events_processed == 1)).await;
    assert_eq!(journal.entries(), vec!["a"]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_lock_is_reacquired_before_running_again() {
    // Given: A running process
    let world = World::new();
    let name = process_name("mailer");
    let process = spawn_recorder(&world, "mailer", Recorder::default());
    process.start().expect("start");
    let _ = within(process.wait_for_state(|state| state == ProcessState::Running)).await;

    // When: Another node takes the lock over
    let usurper = world.provider.take_over(&name);
    let state = within(process.wait_for_state(|state| state == ProcessState::Starting)).await;

    // Then: The process waits until the usurper lets go
    assert_eq!(state, ProcessState::Starting);
    settle().await;
    assert_eq!(process.state(), ProcessState::Starting);

    usurper.unlock().await.expect("unlock");
    let state = within(process.wait_for_state(|state| state == ProcessState::Running)).await;
    assert_eq!(state, ProcessState::Running);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn paused_process_resumes_from_its_checkpoint() {
    // Given: A process that handled two events and was paused
    let world = World::new();
    let _ = append_messages(&world.store, &["a", "b"]).await;
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = spawn_recorder(&world, "mailer", recorder);
    process.start().expect("start");
    let _ = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;
    process.pause().expect("pause");
    let _ = within(process.wait_for_state(|state| state == ProcessState::Inactive)).await;

    // When: More events arrive and the process is started again
    let _ = append_messages(&world.store, &["c"]).await;
    process.start().expect("start");
    let _ = within(process.wait_for_stats(|stats| stats.events_processed == 3)).await;

    // Then: Nothing is handled twice
    assert_eq!(journal.entries(), vec!["a", "b", "c"]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_lock() {
    let world = World::new();
    let name = process_name("mailer");
    let process = spawn_recorder(&world, "mailer", Recorder::default());
    process.start().expect("start");
    let _ = within(process.wait_for_state(|state| state == ProcessState::Running)).await;

    within(process.shutdown()).await;

    let other = world.provider.metadata(&name);
    within(other.wait_for_lock()).await.expect("lock is free");
    assert!(other.is_locked());
}

#[tokio::test(start_paused = true)]
async fn start_while_running_is_ignored() {
    let world = World::new();
    let _ = append_messages(&world.store, &["a"]).await;
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = spawn_recorder(&world, "mailer", recorder);
    process.start().expect("start");
    let _ = within(process.wait_for_stats(|stats| stats.events_processed == 1)).await;

    process.start().expect("start");
    settle().await;

    assert_eq!(process.state(), ProcessState::Running);
    assert_eq!(journal.entries(), vec!["a"]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn store_failures_are_retried_after_a_delay() {
    // Given: A store whose first two feed reads fail
    let world = World::new();
    let store = Arc::new(InMemoryEventStore::new().with_chaos(ChaosConfig::default()));
    let tokens = append_messages(store.inner(), &["a", "b"]).await;
    store.fail_next(Operation::GetAllEvents, 2);
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(process_name("mailer"), recorder)
        .register::<Message>()
        .spawn(EventStreaming::new(store.clone()), &world.provider);

    // When: The process is started
    process.start().expect("start");
    let stats = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    // Then: It kept running and read from the same token every time
    assert_eq!(stats.events_processed, 2);
    assert_eq!(journal.entries(), vec!["a", "b"]);
    assert_eq!(process.state(), ProcessState::Running);
    assert!(store.call_count(Operation::GetAllEvents) >= 3);
    assert!(store
        .calls()
        .iter()
        .take(3)
        .all(|call| call.from_token == Some(Token::Initial)));
    assert!(logs_contain("event store read failed"));
    assert_eq!(world.provider.stored_token(&process_name("mailer")), tokens[1]);
    process.shutdown().await;
}
