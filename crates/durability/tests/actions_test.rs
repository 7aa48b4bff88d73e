//! Durability actions driven one at a time.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use common::{
    Recorder, assert_quiet, cluster, handlers, next_outcome, order, orders, start_node,
};
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;
use wharf_core::{Clock, DurabilitySettings};
use wharf_durability::{
    ActionOutcome, AgentAction, BufferingLimits, DeliveryOutcome, DurabilityError,
    DurabilityResult, DurableNode, ListenerStatus, ListeningAgent,
};
use wharf_store::{
    ANY_NODE, AdvisoryLock, DurabilityOperations, Envelope, INCOMING_MESSAGE_LOCK_ID, MessageInbox,
    MessageOutbox, MessageStore, MessageStoreAdmin, NodePersistence, NodeRecordType,
};

fn orphan(clock: &wharf_core::ManualClock) -> Envelope {
    Envelope::incoming("OrderPlaced", b"{}".to_vec(), orders(), ANY_NODE, clock.now())
}

/// Claims to accept but refuses every page.
struct RefusingListener;

#[async_trait]
impl ListeningAgent for RefusingListener {
    fn status(&self) -> ListenerStatus {
        ListenerStatus::Accepting
    }

    fn queue_count(&self) -> usize {
        0
    }

    fn buffering_limits(&self) -> BufferingLimits {
        BufferingLimits::default()
    }

    async fn enqueue_directly(&self, _envelopes: Vec<Envelope>) -> DurabilityResult<()> {
        Err(DurabilityError::not_accepting("tcp listener"))
    }
}

#[tokio::test]
async fn given_orphaned_incoming_when_recovered_then_it_is_handled() {
    // Given: an incoming envelope nobody owns
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    let envelope = orphan(&clock);
    store.store_incoming(&envelope).await.unwrap();

    // When: incoming recovery runs
    let outcome = node.execute(AgentAction::RecoverIncoming).await.unwrap();

    // Then: this node claims and handles it
    assert_eq!(outcome, ActionOutcome::Done);
    assert_eq!(next_outcome(&mut outcomes).await, (envelope.id, DeliveryOutcome::Handled));
    assert_eq!(recorder.count(envelope.id), 1);
}

#[tokio::test]
async fn given_backlog_larger_than_batch_when_recovering_then_pages_until_done() {
    // Given: 25 orphans and a batch size of 10
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    for _ in 0..25 {
        store.store_incoming(&orphan(&clock)).await.unwrap();
    }

    // When: recovery runs until it stops asking for more
    let mut runs = Vec::new();
    loop {
        let outcome = node.execute(AgentAction::RecoverIncoming).await.unwrap();
        runs.push(outcome);
        if outcome == ActionOutcome::Done {
            break;
        }
    }

    // Then: three pages were claimed and every envelope handled once
    assert_eq!(
        runs,
        vec![ActionOutcome::Reschedule, ActionOutcome::Reschedule, ActionOutcome::Done]
    );
    let mut handled = HashSet::new();
    for _ in 0..25 {
        let (id, outcome) = next_outcome(&mut outcomes).await;
        assert_eq!(outcome, DeliveryOutcome::Handled);
        handled.insert(id);
    }
    assert_eq!(handled.len(), 25);
    assert_eq!(recorder.total(), 25);
}

#[tokio::test]
async fn given_lock_held_elsewhere_when_recovering_then_action_is_skipped() {
    // Given: another process holds the incoming recovery lock
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    store.store_incoming(&orphan(&clock)).await.unwrap();

    let other = store.create_advisory_lock(Uuid::new_v4());
    assert!(other.try_attain_lock(INCOMING_MESSAGE_LOCK_ID).await.unwrap());

    // When: this node tries to recover
    let outcome = node.execute(AgentAction::RecoverIncoming).await.unwrap();

    // Then: nothing is claimed
    assert_eq!(outcome, ActionOutcome::Skipped);
    assert_quiet(&mut outcomes).await;
    assert_eq!(store.fetch_counts().await.unwrap().incoming, 1);

    // And: once released, recovery proceeds
    other.release_lock(INCOMING_MESSAGE_LOCK_ID).await.unwrap();
    assert_eq!(node.execute(AgentAction::RecoverIncoming).await.unwrap(), ActionOutcome::Done);
    assert_eq!(next_outcome(&mut outcomes).await.1, DeliveryOutcome::Handled);
}

#[tokio::test]
async fn given_listener_refuses_page_when_recovering_then_in_flight_work_stays_owned() {
    // Given: one envelope this node is already working on and one orphan,
    // both at a destination whose listener refuses recovered pages
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, _outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    let tcp = Url::parse("tcp://orders:7000").unwrap();
    node.endpoints().add_listener(tcp.clone(), Arc::new(RefusingListener));

    let in_flight =
        Envelope::incoming("OrderPlaced", Vec::new(), tcp.clone(), node.node_number(), clock.now());
    let orphaned = Envelope::incoming("OrderPlaced", Vec::new(), tcp.clone(), ANY_NODE, clock.now());
    store.store_incoming(&in_flight).await.unwrap();
    store.store_incoming(&orphaned).await.unwrap();

    // When: incoming recovery claims the orphan and the listener refuses it
    let outcome = node.execute(AgentAction::RecoverIncoming).await.unwrap();

    // Then: only the refused orphan returns to the pool
    assert_eq!(outcome, ActionOutcome::Done);
    let pool = store.load_page_of_globally_owned_incoming(&tcp, 10).await.unwrap();
    let pooled: Vec<Uuid> = pool.iter().map(|e| e.id).collect();
    assert_eq!(pooled, vec![orphaned.id]);
    assert_eq!(store.find_unique_owners().await.unwrap(), vec![node.node_number()]);
}

#[tokio::test]
async fn given_orphaned_outgoing_when_recovered_then_valid_sent_expired_and_unroutable_dropped() {
    // Given: three unowned outgoing envelopes
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    let valid = order();
    let expired = order().with_deliver_by(clock.now() - Duration::seconds(5));
    let unroutable = Envelope::new(
        "OrderPlaced",
        Vec::new(),
        Url::parse("carrier-pigeon://loft").unwrap(),
    );
    for envelope in [&valid, &expired, &unroutable] {
        store.store_outgoing(envelope, ANY_NODE).await.unwrap();
    }

    // When: outgoing recovery runs
    let outcome = node.execute(AgentAction::RecoverOutgoing).await.unwrap();

    // Then: only the valid one is delivered and the outbox is empty
    assert_eq!(outcome, ActionOutcome::Done);
    assert_eq!(next_outcome(&mut outcomes).await, (valid.id, DeliveryOutcome::Handled));
    assert_quiet(&mut outcomes).await;
    assert_eq!(recorder.total(), 1);
    assert_eq!(store.fetch_counts().await.unwrap().outgoing, 0);
}

#[tokio::test]
async fn given_delayed_envelope_when_polling_then_it_runs_at_its_time_not_before() {
    // Given: an order delayed by thirty seconds
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    let delayed = order().delayed(clock.now(), Duration::seconds(30));
    node.publish(vec![delayed.clone()]).await.unwrap();
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);

    // When: scheduled jobs run before the time
    node.execute(AgentAction::RunScheduledJobs).await.unwrap();
    clock.advance(Duration::seconds(29));
    node.execute(AgentAction::RunScheduledJobs).await.unwrap();

    // Then: nothing is delivered
    assert_quiet(&mut outcomes).await;

    // When: the time arrives
    clock.advance(Duration::seconds(1));
    node.execute(AgentAction::RunScheduledJobs).await.unwrap();

    // Then: it is delivered
    assert_eq!(next_outcome(&mut outcomes).await, (delayed.id, DeliveryOutcome::Handled));
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 0);
}

#[tokio::test]
async fn given_dormant_node_when_leader_reassigns_then_only_its_envelopes_are_released() {
    // Given: two nodes, each owning one incoming envelope
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (silent, _silent_outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    let (leader, _leader_outcomes) = start_node(&store, &clock, handlers(&recorder)).await;

    let silent_owned =
        Envelope::incoming("OrderPlaced", Vec::new(), orders(), silent.node_number(), clock.now());
    let leader_owned =
        Envelope::incoming("OrderPlaced", Vec::new(), orders(), leader.node_number(), clock.now());
    store.store_incoming(&silent_owned).await.unwrap();
    store.store_incoming(&leader_owned).await.unwrap();

    // When: the first node stops heartbeating past the dormancy threshold
    clock.advance(Duration::minutes(2));
    leader.execute(AgentAction::HealthCheck).await.unwrap();
    assert_eq!(
        silent.execute(AgentAction::ReassignDormantNodes).await.unwrap(),
        ActionOutcome::Skipped
    );
    let outcome = leader.execute(AgentAction::ReassignDormantNodes).await.unwrap();

    // Then: only the dormant node's envelope returns to the pool
    assert_eq!(outcome, ActionOutcome::Done);
    let pool = store.load_page_of_globally_owned_incoming(&orders(), 10).await.unwrap();
    let pooled: Vec<Uuid> = pool.iter().map(|e| e.id).collect();
    assert_eq!(pooled, vec![silent_owned.id]);

    let records = store.fetch_node_records(20).await.unwrap();
    assert!(records.iter().any(|r| {
        r.record_type == NodeRecordType::OwnershipReleased && r.node_number == silent.node_number()
    }));
    assert!(records.iter().any(|r| {
        r.record_type == NodeRecordType::LeadershipAssumed && r.node_number == leader.node_number()
    }));
}

#[tokio::test]
async fn given_handled_envelopes_past_retention_when_expiring_then_they_are_deleted() {
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, mut outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    node.publish(vec![order()]).await.unwrap();
    next_outcome(&mut outcomes).await;

    node.execute(AgentAction::DeleteExpired).await.unwrap();
    assert_eq!(store.fetch_counts().await.unwrap().handled, 1);

    clock.advance(Duration::minutes(6));
    node.execute(AgentAction::DeleteExpired).await.unwrap();
    assert_eq!(store.fetch_counts().await.unwrap().handled, 0);
}

#[tokio::test]
async fn given_counts_requested_when_published_then_watchers_see_them() {
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, _outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    store.store_outgoing(&order(), node.node_number()).await.unwrap();

    let counts = node.counts();
    node.execute(AgentAction::PublishCounts).await.unwrap();

    assert_eq!(counts.borrow().outgoing, 1);
}

#[tokio::test]
async fn given_running_timers_when_envelope_comes_due_then_agent_delivers_it() {
    // Given: a node whose timers are running
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (observer, mut outcomes) = mpsc::unbounded_channel();
    let node = DurableNode::builder(Arc::new(store.clone()))
        .with_settings(DurabilitySettings::for_testing())
        .with_clock(Arc::new(clock.clone()))
        .with_handlers(handlers(&recorder))
        .with_local_queue(orders())
        .with_delivery_observer(observer)
        .start()
        .await
        .unwrap();
    assert!(node.agent().is_running().await);

    // When: a delayed order is published and its time passes
    let delayed = order().delayed(clock.now(), Duration::seconds(10));
    node.publish(vec![delayed.clone()]).await.unwrap();
    clock.advance(Duration::seconds(10));

    // Then: the short timer picks it up without help
    assert_eq!(next_outcome(&mut outcomes).await, (delayed.id, DeliveryOutcome::Handled));

    node.stop().await.unwrap();
    assert!(!node.agent().is_running().await);
    assert!(store.load_all_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn given_stopping_node_with_owned_work_when_stopped_then_work_returns_to_pool() {
    let (store, clock) = cluster();
    let recorder = Arc::new(Recorder::default());
    let (node, _outcomes) = start_node(&store, &clock, handlers(&recorder)).await;
    store.store_outgoing(&order(), node.node_number()).await.unwrap();

    node.stop().await.unwrap();

    assert_eq!(store.find_unique_owners().await.unwrap(), Vec::<i32>::new());
    assert_eq!(store.find_outgoing_destinations().await.unwrap(), vec![orders()]);
}
