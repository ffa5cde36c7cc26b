mod common;

use claims::{assert_err, assert_ok};
use common::*;
use server::broker::InMemoryBroker;
use server::model::{EntityKind, OutgoingMessage};
use server::operations::{ClientPool, MessageTransport, OperationOptions, PeekRequest};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str =
    "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=abc=";

#[tokio::test]
async fn listings_report_counts_and_sessions() {
    let broker = broker_with_queue("orders");
    broker.create_queue("checkout", true);
    broker.create_topic("events");
    broker.create_subscription("events", "audit", false).unwrap();
    seed(&broker, "orders", 2);
    let ops = operations(&broker);

    let queues = assert_ok!(ops.list_queues().await);
    let orders = queues.iter().find(|q| q.name == "orders").unwrap();
    assert_eq!(orders.active_count, 2);
    assert!(queues.iter().any(|q| q.name == "checkout" && q.requires_session));

    let topics = assert_ok!(ops.list_topics().await);
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].kind, EntityKind::Topic);

    let subscriptions = assert_ok!(ops.list_subscriptions("events").await);
    assert_eq!(subscriptions[0].parent_topic.as_deref(), Some("events"));
}

#[tokio::test]
async fn empty_namespace_lists_nothing() {
    let ops = operations(&InMemoryBroker::new());
    assert!(assert_ok!(ops.list_queues().await).is_empty());
    assert!(assert_ok!(ops.list_topics().await).is_empty());
}

#[tokio::test]
async fn sent_messages_can_be_peeked() {
    let broker = InMemoryBroker::new();
    broker.create_queue("checkout", true);
    let ops = operations(&broker);

    assert_ok!(
        ops.send_message(
            "checkout",
            OutgoingMessage::text("hello")
                .with_session_id("alpha")
                .with_property("region", "eu")
        )
        .await
    );

    let request = PeekRequest::new(queue("checkout"), 5).with_sessions(true);
    let messages = assert_ok!(ops.peek_messages(&request, &CancellationToken::new()).await);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].session_id.as_deref(), Some("alpha"));
    assert_eq!(messages[0].body_text(), "hello");
}

#[tokio::test]
async fn session_entity_rejects_messages_without_session() {
    let broker = InMemoryBroker::new();
    broker.create_queue("checkout", true);
    let ops = operations(&broker);

    assert_err!(ops.send_message("checkout", OutgoingMessage::text("x")).await);
}

#[tokio::test]
async fn pooled_connections_drive_the_same_broker() {
    let broker = broker_with_queue("orders");
    let pool = ClientPool::new().with_backend(Arc::new(broker.clone()));
    let options = OperationOptions::default();
    let scoped = format!("{NAMESPACE};EntityPath=orders");

    let client = assert_ok!(pool.connection_string(&scoped, EntityKind::Queue, &options).await);
    assert_ok!(client.send_message("orders", OutgoingMessage::text("pooled")).await);
    drop(client);

    let again = assert_ok!(pool.connection_string(&scoped, EntityKind::Queue, &options).await);
    let validation = again.validate_connection().await;
    assert!(validation.valid);
    assert_eq!(validation.resolved_entity.as_deref(), Some("orders"));
    assert_eq!(broker.message_count(&queue("orders")), 1);
    assert_eq!(pool.len().await, 1);

    pool.shutdown().await;
    assert!(pool.is_empty().await);
}
