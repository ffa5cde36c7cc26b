mod common;

use claims::{assert_matches, assert_ok};
use common::*;
use server::broker::InMemoryBroker;
use server::common::ServiceBusError;
use server::live_stream::{
    LiveStreamEngine, LiveStreamOptions, StreamBuffer, StreamEvent, StreamNotification,
    StreamRequest, StreamState,
};
use server::model::OutgoingMessage;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn stream_options() -> LiveStreamOptions {
    LiveStreamOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_receive_timeout(Duration::from_secs(1))
        .with_error_backoff(Duration::from_millis(20))
        .with_stop_timeout(Duration::from_secs(2))
        .with_batch_size(10)
        .with_flush_interval(Duration::from_millis(10))
}

async fn next_notification(
    notifications: &flume::Receiver<StreamNotification>,
) -> StreamNotification {
    tokio::time::timeout(WAIT, notifications.recv_async())
        .await
        .expect("timed out waiting for a notification")
        .expect("engine dropped")
}

async fn next_messages(
    notifications: &flume::Receiver<StreamNotification>,
    count: usize,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        if let StreamNotification::Message(event) = next_notification(notifications).await {
            events.push(event);
        }
    }
    events
}

async fn wait_until_idle(engine: &LiveStreamEngine) {
    tokio::time::timeout(WAIT, async {
        while engine.is_streaming() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream did not end");
}

#[tokio::test]
async fn peek_stream_emits_each_message_once_in_order() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 3);
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &CancellationToken::new())
            .await
    );
    let first = next_messages(&notifications, 3).await;
    seed(&broker, "orders", 2);
    let second = next_messages(&notifications, 2).await;

    let sequences: Vec<i64> = first
        .iter()
        .chain(second.iter())
        .map(StreamEvent::sequence_number)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    assert_eq!(first[0].entity_name, "orders");
    assert_eq!(engine.stats().emitted, 5);

    assert_ok!(engine.stop_stream().await);
    assert_eq!(broker.message_count(&queue("orders")), 5);
}

#[tokio::test]
async fn nothing_is_emitted_after_stop_returns() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 1);
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &CancellationToken::new())
            .await
    );
    next_messages(&notifications, 1).await;
    assert_ok!(engine.stop_stream().await);
    let drained: Vec<_> = notifications.try_iter().collect();
    assert_eq!(drained.last(), Some(&StreamNotification::StatusChanged(false)));

    seed(&broker, "orders", 5);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(notifications.try_iter().next().is_none());
    assert_eq!(engine.state(), StreamState::Idle);
}

#[tokio::test]
async fn status_changes_fire_once_per_transition() {
    let broker = broker_with_queue("orders");
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(engine.stop_stream().await);
    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &CancellationToken::new())
            .await
    );
    assert_eq!(engine.state(), StreamState::Streaming);
    assert_ok!(engine.stop_stream().await);
    assert_ok!(engine.stop_stream().await);

    let statuses: Vec<bool> = notifications
        .try_iter()
        .filter_map(|n| match n {
            StreamNotification::StatusChanged(streaming) => Some(streaming),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![true, false]);
    assert!(engine.current_session().await.is_none());
}

#[tokio::test]
async fn missing_entity_stops_the_stream() {
    let broker = InMemoryBroker::new();
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "missing", true, &CancellationToken::new())
            .await
    );
    wait_until_idle(&engine).await;

    assert_eq!(engine.state(), StreamState::Idle);
    assert_eq!(engine.stats().errors, 1);
    assert!(
        notifications
            .try_iter()
            .any(|n| matches!(n, StreamNotification::Error(_)))
    );
}

#[tokio::test]
async fn transient_failures_are_reported_and_retried() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 1);
    broker.fail_next_peeks(2);
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &CancellationToken::new())
            .await
    );

    let mut errors = 0;
    loop {
        match next_notification(&notifications).await {
            StreamNotification::Error(_) => errors += 1,
            StreamNotification::Message(event) => {
                assert_eq!(event.sequence_number(), 1);
                break;
            }
            StreamNotification::StatusChanged(_) => {}
        }
    }
    assert_eq!(errors, 2);
    assert!(engine.is_streaming());
    assert_ok!(engine.stop_stream().await);
}

#[tokio::test]
async fn authentication_failures_do_not_end_the_stream() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 1);
    broker.fail_next_peeks_with(
        1,
        ServiceBusError::AuthenticationFailed("token expired".to_string()),
    );
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &CancellationToken::new())
            .await
    );
    let events = next_messages(&notifications, 1).await;

    assert_eq!(events[0].sequence_number(), 1);
    assert_eq!(engine.stats().errors, 1);
    assert!(engine.is_streaming());
    assert_ok!(engine.stop_stream().await);
}

#[tokio::test]
async fn processor_mode_leaves_messages_in_place() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 2);
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", false, &CancellationToken::new())
            .await
    );
    let events = next_messages(&notifications, 2).await;
    assert_ok!(engine.stop_stream().await);

    assert!(events.iter().all(|e| e.message.body_text().starts_with("payload")));
    assert!(broker.abandoned_count() >= 2);
    assert_eq!(broker.message_count(&queue("orders")), 2);
    assert_eq!(broker.locked_count(&queue("orders")), 0);
}

#[tokio::test]
async fn processor_mode_rejects_session_entities() {
    let broker = InMemoryBroker::new();
    broker.create_queue("checkout", true);
    let engine = LiveStreamEngine::new(stream_options());

    let request = StreamRequest::queue("checkout")
        .with_sessions(true)
        .with_peek_only(false);
    let result = engine
        .start_stream(transport(&broker), request, &CancellationToken::new())
        .await;

    assert_matches!(result, Err(ServiceBusError::ConfigurationError(_)));
    assert_eq!(engine.state(), StreamState::Idle);
    assert!(!engine.is_streaming());
}

#[tokio::test]
async fn session_entities_stream_in_peek_mode() {
    let broker = InMemoryBroker::new();
    broker.create_queue("checkout", true);
    seed_session(&broker, "checkout", "alpha", 2);
    seed_session(&broker, "checkout", "beta", 1);
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();

    let request = StreamRequest::queue("checkout").with_sessions(true);
    assert_ok!(
        engine
            .start_stream(transport(&broker), request, &CancellationToken::new())
            .await
    );
    let events = next_messages(&notifications, 3).await;
    assert_ok!(engine.stop_stream().await);

    let sequences: Vec<i64> = events.iter().map(StreamEvent::sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(broker.locked_session_count(&queue("checkout")), 0);
}

#[tokio::test]
async fn session_streams_reach_older_messages_in_other_sessions() {
    let broker = InMemoryBroker::new();
    broker.create_queue("checkout", true);
    // beta holds the oldest message but alpha fills the first batch
    seed_session(&broker, "checkout", "beta", 1);
    seed_session(&broker, "checkout", "alpha", 2);
    let engine = LiveStreamEngine::new(stream_options().with_batch_size(2));
    let notifications = engine.subscribe();

    let request = StreamRequest::queue("checkout").with_sessions(true);
    assert_ok!(
        engine
            .start_stream(transport(&broker), request, &CancellationToken::new())
            .await
    );
    let events = next_messages(&notifications, 3).await;
    assert_ok!(engine.stop_stream().await);

    let mut sequences: Vec<i64> = events.iter().map(StreamEvent::sequence_number).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn starting_again_replaces_the_running_stream() {
    let broker = broker_with_queue("orders");
    broker.create_topic("events");
    broker.create_subscription("events", "audit", false).unwrap();
    let engine = LiveStreamEngine::new(stream_options());
    let notifications = engine.subscribe();
    let cancel = CancellationToken::new();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &cancel)
            .await
    );
    assert_ok!(
        engine
            .start_subscription_stream(transport(&broker), "events", "audit", true, &cancel)
            .await
    );

    let session = engine.current_session().await.unwrap();
    assert_eq!(session.entity_name, "events");
    assert_eq!(session.subscription_name.as_deref(), Some("audit"));

    broker
        .enqueue("events", OutgoingMessage::text("created"))
        .unwrap();
    let event = next_messages(&notifications, 1).await.remove(0);
    assert_eq!(event.entity_name, "audit");
    assert_eq!(event.parent_topic.as_deref(), Some("events"));
    assert_ok!(engine.stop_stream().await);
}

#[tokio::test]
async fn caller_cancellation_ends_the_stream() {
    let broker = broker_with_queue("orders");
    let engine = LiveStreamEngine::new(stream_options());
    let cancel = CancellationToken::new();

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &cancel)
            .await
    );
    cancel.cancel();
    wait_until_idle(&engine).await;

    assert_eq!(engine.state(), StreamState::Idle);
    assert_ok!(engine.stop_stream().await);
}

#[tokio::test]
async fn buffer_collects_stream_events() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 4);
    let engine = LiveStreamEngine::new(stream_options());
    let buffer = StreamBuffer::from_options(&stream_options().with_buffer_capacity(3));
    let batches = buffer.subscribe_batches();
    let feed = CancellationToken::new();
    let feeder = buffer.attach(engine.subscribe(), feed.clone());

    assert_ok!(
        engine
            .start_queue_stream(transport(&broker), "orders", true, &CancellationToken::new())
            .await
    );
    let mut received = 0;
    while received < 4 {
        let batch = tokio::time::timeout(WAIT, batches.recv_async())
            .await
            .unwrap()
            .unwrap();
        received += batch.len();
    }
    assert_ok!(engine.stop_stream().await);
    feed.cancel();
    assert_ok!(feeder.await);

    let kept: Vec<i64> = buffer.snapshot().iter().map(StreamEvent::sequence_number).collect();
    assert_eq!(kept, vec![2, 3, 4]);
}
