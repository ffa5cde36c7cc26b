#![allow(dead_code)]

use server::broker::InMemoryBroker;
use server::model::{EntityAddress, OutgoingMessage};
use server::operations::{MessageTransport, OperationOptions, ServiceBusOperations};
use std::sync::Arc;
use std::time::Duration;

/// Options with short windows so scans over an in-memory broker end quickly.
pub fn fast_options() -> OperationOptions {
    OperationOptions::default()
        .with_purge_receive_timeout(Duration::from_millis(50))
        .with_delete_receive_timeout(Duration::from_millis(50))
        .with_session_accept_timeout(Duration::from_millis(200))
        .with_operation_timeout(Duration::from_secs(5))
}

pub fn operations(broker: &InMemoryBroker) -> ServiceBusOperations {
    operations_with(broker, fast_options())
}

pub fn operations_with(broker: &InMemoryBroker, options: OperationOptions) -> ServiceBusOperations {
    ServiceBusOperations::new(Arc::new(broker.clone()), Arc::new(broker.clone()), options)
}

pub fn transport(broker: &InMemoryBroker) -> Arc<dyn MessageTransport> {
    Arc::new(operations(broker))
}

pub fn broker_with_queue(name: &str) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_queue(name, false);
    broker
}

/// Enqueues `count` messages with ids `m1`, `m2`, ... and returns their
/// sequence numbers.
pub fn seed(broker: &InMemoryBroker, entity: &str, count: usize) -> Vec<i64> {
    (1..=count)
        .map(|i| {
            let message = OutgoingMessage::text(&format!("payload {i}")).with_message_id(format!("m{i}"));
            broker.enqueue(entity, message).unwrap()
        })
        .collect()
}

pub fn seed_session(broker: &InMemoryBroker, entity: &str, session: &str, count: usize) -> Vec<i64> {
    (0..count)
        .map(|i| {
            let message = OutgoingMessage::text(&format!("{session} payload {i}")).with_session_id(session);
            broker.enqueue(entity, message).unwrap()
        })
        .collect()
}

pub fn queue(name: &str) -> EntityAddress {
    EntityAddress::entity(name)
}
