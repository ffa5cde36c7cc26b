mod common;

use claims::assert_ok;
use common::*;
use proptest::prelude::*;
use server::broker::InMemoryBroker;
use server::model::EntityAddress;
use server::operations::{MessageTransport, PeekRequest};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn purge_removes_everything() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 25);
    let ops = operations(&broker);

    let purged = assert_ok!(ops.purge_messages(&queue("orders"), &CancellationToken::new()).await);
    assert_eq!(purged, 25);
    assert_eq!(broker.message_count(&queue("orders")), 0);
}

#[tokio::test]
async fn purging_an_empty_entity_twice_completes_nothing() {
    let broker = broker_with_queue("orders");
    let ops = operations(&broker);
    let cancel = CancellationToken::new();

    assert_eq!(assert_ok!(ops.purge_messages(&queue("orders"), &cancel).await), 0);
    assert_eq!(assert_ok!(ops.purge_messages(&queue("orders"), &cancel).await), 0);
    assert_eq!(broker.completed_count(), 0);
}

#[tokio::test]
async fn purge_of_dead_letter_queue_leaves_main_queue() {
    let broker = broker_with_queue("orders");
    let sequences = seed(&broker, "orders", 4);
    broker.dead_letter(&queue("orders"), sequences[0], "bad").unwrap();
    let ops = operations(&broker);

    let dead_letter = queue("orders").with_dead_letter(true);
    let purged = assert_ok!(ops.purge_messages(&dead_letter, &CancellationToken::new()).await);
    assert_eq!(purged, 1);
    assert_eq!(broker.message_count(&queue("orders")), 3);
}

#[tokio::test]
async fn cancelled_purge_returns_partial_count() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 10);
    let ops = operations(&broker);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let purged = assert_ok!(ops.purge_messages(&queue("orders"), &cancel).await);
    assert_eq!(purged, 0);
    assert_eq!(broker.message_count(&queue("orders")), 10);
}

#[tokio::test]
async fn delete_removes_only_targets_and_releases_the_rest() {
    let broker = broker_with_queue("orders");
    let sequences = seed(&broker, "orders", 10);
    let ops = operations(&broker);
    let targets = vec![sequences[2], sequences[5], 9_999];

    let result = assert_ok!(
        ops.delete_messages_detailed(&queue("orders"), &targets, &CancellationToken::new())
            .await
    );

    assert_eq!(result.successful, 2);
    assert_eq!(broker.message_count(&queue("orders")), 8);
    assert_eq!(broker.locked_count(&queue("orders")), 0);
    let remaining: HashSet<i64> = broker.sequence_numbers(&queue("orders")).into_iter().collect();
    assert!(!remaining.contains(&sequences[2]));
    assert!(!remaining.contains(&sequences[5]));
}

#[tokio::test]
async fn deleting_twice_deletes_nothing_the_second_time() {
    let broker = broker_with_queue("orders");
    let sequences = seed(&broker, "orders", 6);
    let ops = operations(&broker);
    let cancel = CancellationToken::new();
    let targets = &sequences[..3];

    assert_eq!(assert_ok!(ops.delete_messages(&queue("orders"), targets, &cancel).await), 3);
    assert_eq!(assert_ok!(ops.delete_messages(&queue("orders"), targets, &cancel).await), 0);
}

#[tokio::test]
async fn resend_counts_each_accepted_copy() {
    let broker = broker_with_queue("orders");
    broker.create_queue("archive", false);
    seed(&broker, "orders", 5);
    broker.fail_message_id("m3");
    let ops = operations(&broker);
    let cancel = CancellationToken::new();

    let messages = assert_ok!(
        ops.peek_messages(&PeekRequest::new(queue("orders"), 5), &cancel)
            .await
    );
    let result = assert_ok!(ops.resend_messages_detailed("archive", &messages, &cancel).await);

    assert_eq!(result.successful, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(broker.message_count(&queue("archive")), 4);
    assert_eq!(broker.message_count(&queue("orders")), 5);
}

#[tokio::test]
async fn resend_to_missing_entity_fails() {
    let broker = broker_with_queue("orders");
    seed(&broker, "orders", 1);
    let ops = operations(&broker);
    let cancel = CancellationToken::new();

    let messages = assert_ok!(
        ops.peek_messages(&PeekRequest::new(queue("orders"), 1), &cancel)
            .await
    );
    assert!(ops.resend_messages("nowhere", &messages, &cancel).await.is_err());
}

#[tokio::test]
async fn resubmit_moves_dead_letters_back() {
    let broker = broker_with_queue("orders");
    let sequences = seed(&broker, "orders", 3);
    for sequence in &sequences[..2] {
        broker.dead_letter(&queue("orders"), *sequence, "retry me").unwrap();
    }
    let ops = operations(&broker);
    let cancel = CancellationToken::new();
    let dead_letter = queue("orders").with_dead_letter(true);

    let dead = assert_ok!(ops.peek_messages(&PeekRequest::new(dead_letter.clone(), 10), &cancel).await);
    let resubmitted = assert_ok!(
        ops.resubmit_dead_letter_messages(&queue("orders"), &dead, &cancel)
            .await
    );

    assert_eq!(resubmitted, 2);
    assert_eq!(broker.message_count(&dead_letter), 0);
    assert_eq!(broker.message_count(&queue("orders")), 3);
}

#[tokio::test]
async fn resubmit_from_subscription_goes_through_the_topic() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events");
    broker.create_subscription("events", "audit", false).unwrap();
    broker.create_subscription("events", "billing", false).unwrap();
    let audit = EntityAddress::subscription("events", "audit");
    let billing = EntityAddress::subscription("events", "billing");
    let sequences = seed(&broker, "events", 1);
    broker.dead_letter(&audit, sequences[0], "poison").unwrap();
    let ops = operations(&broker);
    let cancel = CancellationToken::new();

    let dead = assert_ok!(
        ops.peek_messages(&PeekRequest::new(audit.clone().with_dead_letter(true), 10), &cancel)
            .await
    );
    assert_eq!(
        assert_ok!(ops.resubmit_dead_letter_messages(&audit, &dead, &cancel).await),
        1
    );

    assert_eq!(broker.message_count(&audit), 1);
    assert_eq!(broker.message_count(&billing), 2);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn delete_never_exceeds_requested_set(
        total in 1usize..30,
        picks in prop::collection::vec(0usize..40, 0..12),
    ) {
        let broker = broker_with_queue("orders");
        let sequences = seed(&broker, "orders", total);
        let ops = operations(&broker);
        let targets: Vec<i64> = picks
            .iter()
            .map(|&i| sequences.get(i).copied().unwrap_or(10_000 + i as i64))
            .collect();
        let distinct: HashSet<i64> = targets.iter().copied().collect();
        let present = distinct.iter().filter(|s| sequences.contains(s)).count();

        let rt = runtime();
        let cancel = CancellationToken::new();
        let deleted = rt
            .block_on(ops.delete_messages(&queue("orders"), &targets, &cancel))
            .unwrap();
        prop_assert!(deleted <= distinct.len());
        prop_assert_eq!(deleted, present);
        prop_assert_eq!(broker.message_count(&queue("orders")), total - present);

        let again = rt
            .block_on(ops.delete_messages(&queue("orders"), &targets, &cancel))
            .unwrap();
        prop_assert_eq!(again, 0);
    }
}
