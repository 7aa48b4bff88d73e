//! Local delivery through the outbox, handlers, retries and dead letters.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{Recorder, cluster, handlers, next_outcome, order, orders, start_node};
use url::Url;
use wharf_core::Clock;
use wharf_durability::{
    AgentAction, DeliveryOutcome, DurabilityError, HandlerRegistry, NO_HANDLER_EXCEPTION,
};
use wharf_store::{
    ANY_NODE, DeadLetterQuery, DeadLetters, Envelope, MessageOutbox, MessageStoreAdmin,
    NodePersistence,
};

#[tokio::test]
async fn given_published_order_when_delivered_then_it_is_marked_handled() {
    // Given: a node handling orders
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    // When: an order is published through the outbox
    let envelope = order();
    node.publish(vec![envelope.clone()]).await.unwrap();

    // Then: it is handled once and nothing is left pending
    assert_eq!(next_outcome(&mut outcomes).await, (envelope.id, DeliveryOutcome::Handled));
    assert_eq!(recorder.count(envelope.id), 1);

    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.handled, 1);
    assert_eq!(counts.incoming, 0);
    assert_eq!(counts.outgoing, 0);
}

#[tokio::test]
async fn given_node_clock_behind_wall_time_when_published_then_sent_at_follows_node_clock() {
    // Given: a node whose clock runs a day behind and a destination with no transport
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, _outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    clock.set(clock.now() - Duration::days(1));
    let billing = Url::parse("tcp://billing:9000").unwrap();

    // When: an envelope built against wall time is published there
    let envelope = Envelope::new("InvoiceRequested", b"{}".to_vec(), billing.clone());
    node.publish(vec![envelope.clone()]).await.unwrap();

    // Then: the stored row carries the node clock's time and waits for recovery
    let stored = store.load_outgoing(&billing).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, envelope.id);
    assert_eq!(stored[0].sent_at, clock.now());
    assert_eq!(stored[0].owner_id, ANY_NODE);
}

#[tokio::test]
async fn given_handler_sends_when_it_succeeds_then_its_messages_follow() {
    // Given: orders are answered with invoices
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let registry = HandlerRegistry::new()
        .with_handler("OrderPlaced", Arc::new(common::Invoicing))
        .with_handler("InvoiceRequested", recorder.clone());
    let (node, mut outcomes) = start_node(&store, &clock, registry).await;

    // When: an order arrives
    let envelope = order();
    node.publish(vec![envelope.clone()]).await.unwrap();

    // Then: the order and the invoice it caused are both handled
    assert_eq!(next_outcome(&mut outcomes).await, (envelope.id, DeliveryOutcome::Handled));
    let (invoice_id, outcome) = next_outcome(&mut outcomes).await;
    assert_eq!(outcome, DeliveryOutcome::Handled);
    assert_ne!(invoice_id, envelope.id);
    assert_eq!(recorder.count(invoice_id), 1);

    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.handled, 2);
    assert_eq!(counts.outgoing, 0);
}

#[tokio::test]
async fn given_failing_handler_when_attempts_run_out_then_envelope_is_dead_lettered() {
    // Given: a handler that always declines payments
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    let payment = Envelope::new("PaymentTaken", b"{}".to_vec(), orders());
    node.publish(vec![payment.clone()]).await.unwrap();

    // When: the first attempt fails
    assert_eq!(next_outcome(&mut outcomes).await, (payment.id, DeliveryOutcome::Retried));
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);

    // And: each retry comes due and fails again
    clock.advance(Duration::seconds(1));
    node.execute(AgentAction::RunScheduledJobs).await.unwrap();
    assert_eq!(next_outcome(&mut outcomes).await, (payment.id, DeliveryOutcome::Retried));

    clock.advance(Duration::seconds(1));
    node.execute(AgentAction::RunScheduledJobs).await.unwrap();

    // Then: the third failure moves it to dead letters with the handler's error
    assert_eq!(next_outcome(&mut outcomes).await, (payment.id, DeliveryOutcome::DeadLettered));

    let page = store.query_dead_letters(&DeadLetterQuery::new()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.envelopes[0].exception_type, "PaymentDeclined");
    assert_eq!(page.envelopes[0].envelope.attempts, 3);

    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.incoming, 0);
}

#[tokio::test]
async fn given_no_handler_when_envelope_arrives_then_it_is_dead_lettered_at_once() {
    // Given: a node without a handler for refunds
    let (store, clock) = cluster();
    let (node, mut outcomes) = start_node(&store, &clock, HandlerRegistry::new()).await;

    // When: a refund is published
    let refund = Envelope::new("RefundIssued", Vec::new(), orders());
    node.publish(vec![refund.clone()]).await.unwrap();

    // Then: no retry is attempted
    assert_eq!(next_outcome(&mut outcomes).await, (refund.id, DeliveryOutcome::DeadLettered));
    let page = store
        .query_dead_letters(&DeadLetterQuery::new().with_exception_type(NO_HANDLER_EXCEPTION))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.envelopes[0].envelope.attempts, 0);
}

#[tokio::test]
async fn given_buffered_envelope_when_sent_twice_then_handler_runs_once() {
    // Given: a node handling orders
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    // When: the same unpersisted envelope is delivered twice
    let envelope = order();
    node.send_buffered(envelope.clone()).await.unwrap();
    node.send_buffered(envelope.clone()).await.unwrap();

    // Then: the eager idempotency check stops the second delivery
    assert_eq!(next_outcome(&mut outcomes).await, (envelope.id, DeliveryOutcome::Handled));
    assert_eq!(next_outcome(&mut outcomes).await, (envelope.id, DeliveryOutcome::Duplicate));
    assert_eq!(recorder.count(envelope.id), 1);
    assert_eq!(store.fetch_counts().await.unwrap().handled, 1);
}

#[tokio::test]
async fn given_buffered_envelope_when_handler_fails_then_retry_is_durable() {
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    let payment = Envelope::new("PaymentTaken", Vec::new(), orders());
    node.send_buffered(payment.clone()).await.unwrap();

    assert_eq!(next_outcome(&mut outcomes).await, (payment.id, DeliveryOutcome::Retried));
    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.scheduled, 1);
    assert_eq!(counts.handled, 0);
}

#[tokio::test]
async fn given_expired_envelope_when_delivered_then_handler_is_skipped() {
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    let stale = order().with_deliver_by(clock.now() - Duration::seconds(1));
    node.publish(vec![stale.clone()]).await.unwrap();

    assert_eq!(next_outcome(&mut outcomes).await, (stale.id, DeliveryOutcome::Expired));
    assert_eq!(recorder.total(), 0);
    assert_eq!(store.fetch_counts().await.unwrap().handled, 1);
}

#[tokio::test]
async fn given_stopped_node_when_sending_then_it_refuses_and_has_left() {
    // Given: a running node
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, _outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    assert_eq!(store.load_all_nodes().await.unwrap().len(), 1);

    // When: it stops
    node.stop().await.unwrap();

    // Then: it takes no more work and its row is gone
    let result = node.send_buffered(order()).await;
    assert!(matches!(result, Err(DurabilityError::NotAccepting { .. })));
    assert!(store.load_all_nodes().await.unwrap().is_empty());
    assert!(matches!(node.stop().await, Err(DurabilityError::NotStarted)));
}
