mod common;

use common::{append_messages, process_name, within, Message, Recorder, World};
use eventline::{
    EventProcessTracking, EventStore, ExpectedVersion, FlushThreshold, MetadataProvider, NewEvent,
    NotificationBus, ProcessConfig, ProcessState, SimpleProcess, StoredEvent, Token,
    TrackingConfig,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn fatal_handler_error_dead_letters_the_event() {
    // Given: Five events, the third of which the handler rejects
    let world = World::new();
    let name = process_name("mailer");
    let tokens = append_messages(&world.store, &["1", "2", "3", "4", "5"]).await;
    let recorder = Recorder {
        fatal: vec!["3".to_owned()],
        ..Recorder::default()
    };
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(name.clone(), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider);

    // When: The process consumes the feed
    process.start().expect("start");
    let stats = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    // Then: The rejected event is dead-lettered and the rest is handled
    assert_eq!(journal.entries(), vec!["1", "2", "4", "5"]);
    assert_eq!(stats.events_processed, 5);
    assert_eq!(stats.dead_letters, 1);
    let letters = world.dead_letters.for_process(&name);
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event.token, tokens[2]);
    assert_eq!(world.provider.stored_token(&name), tokens[4]);
    assert_eq!(process.state(), ProcessState::Running);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_handler_error_is_retried_once() {
    // Given: Five events, the fourth of which fails transiently once
    let world = World::new();
    let name = process_name("mailer");
    let _ = append_messages(&world.store, &["1", "2", "3", "4", "5"]).await;
    let recorder = Recorder {
        flaky: vec!["4".to_owned()],
        ..Recorder::default()
    };
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(name.clone(), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider);

    // When: The process consumes the feed
    process.start().expect("start");
    let stats = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    // Then: The retry succeeds and nothing is dead-lettered
    assert_eq!(journal.entries(), vec!["1", "2", "3", "4!", "4", "5"]);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.dead_letters, 0);
    assert!(world.dead_letters.is_empty());
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_transient_error_is_dead_lettered() {
    let world = World::new();
    let name = process_name("mailer");
    let _ = append_messages(&world.store, &["1", "2"]).await;
    let recorder = Recorder {
        flaky: vec!["1".to_owned(), "1".to_owned()],
        ..Recorder::default()
    };
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(name.clone(), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider);

    process.start().expect("start");
    let stats = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    assert_eq!(journal.entries(), vec!["1!", "1!", "2"]);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.dead_letters, 1);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn checkpoints_follow_the_flush_threshold() {
    // Given: A flush threshold of two and five events
    let world = World::new();
    let name = process_name("mailer");
    let tokens = append_messages(&world.store, &["1", "2", "3", "4", "5"]).await;
    let config = ProcessConfig::default()
        .with_flush_threshold(FlushThreshold::try_new(2).expect("valid threshold"));
    let process = SimpleProcess::builder(name.clone(), Recorder::default())
        .register::<Message>()
        .with_config(config)
        .spawn(world.streaming(), &world.provider);

    // When: The process consumes the feed
    process.start().expect("start");
    let stats = within(process.wait_for_stats(|stats| {
        stats.events_processed == 5 && stats.checkpoints_saved == 3
    }))
    .await;

    // Then: It saved after events 2 and 4, and at the end of the feed
    assert_eq!(stats.checkpoints_saved, 3);
    assert_eq!(world.provider.stored_token(&name), tokens[4]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stored_checkpoint_is_the_starting_point() {
    let world = World::new();
    let name = process_name("mailer");
    let tokens = append_messages(&world.store, &["1", "2", "3", "4", "5"]).await;
    world
        .provider
        .metadata(&name)
        .set_token(tokens[2])
        .await
        .expect("seed checkpoint");
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(name.clone(), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider);

    process.start().expect("start");
    let _ = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    assert_eq!(journal.entries(), vec!["4", "5"]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unregistered_event_types_are_skipped_but_checkpointed() {
    let world = World::new();
    let name = process_name("mailer");
    let tokens = append_messages(&world.store, &["1"]).await;
    let other = world
        .store
        .add_to_stream(
            &common::stream("other"),
            vec![NewEvent::new("SomethingElse", "json", "{}")],
            ExpectedVersion::Any,
        )
        .await
        .expect("append");
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(name.clone(), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider);

    process.start().expect("start");
    let stats = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    assert_eq!(journal.entries(), vec!["1"]);
    assert_eq!(stats.events_processed, 2);
    assert_eq!(stats.dead_letters, 0);
    assert_eq!(world.provider.stored_token(&name), other.tokens()[0]);
    assert!(tokens[0] < other.tokens()[0]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pushed_event_reaches_a_waiting_process() {
    // Given: A process that caught up with two events
    let world = World::new();
    let name = process_name("mailer");
    let _ = append_messages(&world.store, &["1", "2"]).await;
    let recorder = Recorder::default();
    let journal = recorder.journal.clone();
    let process = SimpleProcess::builder(name.clone(), recorder)
        .register::<Message>()
        .spawn(world.streaming(), &world.provider);
    process.start().expect("start");
    let _ = within(process.wait_for_stats(|stats| stats.checkpoints_saved == 1)).await;

    // When: The next event is pushed to it
    let pushed = StoredEvent {
        event_type: "Message".to_owned(),
        format: "json".to_owned(),
        body: Some(r#"{"text":"pushed"}"#.to_owned()),
        stream_name: None,
        stream_version: 0,
        token: Token::Numbered(3),
    };
    world.bus.notify(&name, &pushed);
    let _ = within(process.wait_for_stats(|stats| stats.events_processed == 3)).await;

    // Then: It is handled like any other event
    assert_eq!(journal.entries(), vec!["1", "2", "pushed"]);
    process.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn tracker_finishes_once_every_tracked_process_caught_up() {
    // Given: Two tracked processes
    let world = World::new();
    let tracking = EventProcessTracking::new(TrackingConfig::default());
    let billing = SimpleProcess::builder(process_name("billing"), Recorder::default())
        .register::<Message>()
        .with_tracking(tracking.clone())
        .spawn(world.streaming(), &world.provider);
    let shipping = SimpleProcess::builder(process_name("shipping"), Recorder::default())
        .register::<Message>()
        .with_tracking(tracking.clone())
        .spawn(world.streaming(), &world.provider);
    billing.start().expect("start");

    // When: A producer commits events and tracks them
    let tokens = append_messages(&world.store, &["order-1", "order-2"]).await;
    let mut source = tracking.create_tracker();
    source.add_tokens(&tokens);
    let id = tracking.commit_to_tracker(source);
    let tracker = tracking.find_tracker(id).expect("committed");

    // Then: The tracker waits for the process that is not running yet
    assert!(!tracker.wait_for_finish(Duration::from_secs(2)).await);
    shipping.start().expect("start");
    assert!(tracker.wait_for_finish(Duration::from_secs(30)).await);

    billing.shutdown().await;
    shipping.shutdown().await;
}
