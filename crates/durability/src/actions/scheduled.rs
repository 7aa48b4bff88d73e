use wharf_core::ResultExt;
use wharf_store::{DurabilityOperations, MessageInbox};

use super::{ActionOutcome, AgentContext};
use crate::error::DurabilityResult;

pub(super) async fn run(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let now = context.clock.now();
    let limit = context
        .settings
        .recovery_batch_size
        .min(context.local_queue.capacity());
    if limit == 0 {
        tracing::debug!("Local queue is full, leaving scheduled envelopes for later");
        return Ok(ActionOutcome::Done);
    }

    let due = context.store.load_scheduled_to_execute(now, limit).await?;
    if due.is_empty() {
        return Ok(ActionOutcome::Done);
    }

    // Ownership and the flip to incoming commit before anything is queued.
    let mut claimed = context
        .store
        .reassign_scheduled(context.node_number, &due)
        .await?;
    tracing::info!(due = due.len(), claimed = claimed.len(), "Running scheduled envelopes");

    let mut refused = None;
    for (index, envelope) in claimed.iter().enumerate() {
        let queued = context.local_queue.enqueue(envelope.clone()).await.inspect_error(|e| {
            tracing::warn!(envelope_id = %envelope.id, error = %e, "Local queue refused scheduled envelope");
        });
        if queued.is_err() {
            refused = Some(index);
            break;
        }
    }

    if let Some(index) = refused {
        let unqueued = claimed.split_off(index);
        let released = context
            .store
            .release_incoming_envelopes(context.node_number, &unqueued)
            .await?;
        tracing::debug!(released, "Released scheduled envelopes the local queue refused");
        return Ok(ActionOutcome::Done);
    }

    if due.len() >= limit {
        Ok(ActionOutcome::Reschedule)
    } else {
        Ok(ActionOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::watch;
    use url::Url;
    use uuid::Uuid;
    use wharf_core::{Clock, DurabilitySettings, ManualClock};
    use wharf_store::{
        ANY_NODE, AdvisoryLock, Envelope, InMemoryMessageStore, MessageStore, MessageStoreAdmin,
        PersistedCounts,
    };

    use super::*;
    use crate::error::DurabilityError;
    use crate::nodes::{LeaderElection, NodeRegistry};
    use crate::transport::{EndpointRegistry, LocalQueue};

    /// Reports `capacity` free slots but takes only `room` envelopes.
    struct FakeQueue {
        capacity: usize,
        room: usize,
        taken: Mutex<Vec<Uuid>>,
    }

    impl FakeQueue {
        fn new(capacity: usize, room: usize) -> Arc<Self> {
            Arc::new(Self {
                capacity,
                room,
                taken: Mutex::new(Vec::new()),
            })
        }

        fn taken(&self) -> Vec<Uuid> {
            self.taken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocalQueue for FakeQueue {
        fn capacity(&self) -> usize {
            self.capacity
        }

        async fn enqueue(&self, envelope: Envelope) -> DurabilityResult<()> {
            let mut taken = self.taken.lock().unwrap();
            if taken.len() >= self.room {
                return Err(DurabilityError::not_accepting("fake queue"));
            }
            taken.push(envelope.id);
            Ok(())
        }
    }

    const NODE: i32 = 1;

    fn orders() -> Url {
        Url::parse("local://orders").unwrap()
    }

    fn context(store: &InMemoryMessageStore, clock: &ManualClock, queue: Arc<FakeQueue>) -> AgentContext {
        let store: Arc<dyn MessageStore> = Arc::new(store.clone());
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let settings = DurabilitySettings::for_testing();
        let locks: Arc<dyn AdvisoryLock> = Arc::from(store.create_advisory_lock(Uuid::new_v4()));
        AgentContext {
            registry: Arc::new(NodeRegistry::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                settings.clone(),
            )),
            leadership: Arc::new(LeaderElection::new(
                Arc::clone(&store),
                Arc::clone(&locks),
                Arc::clone(&clock),
                Uuid::new_v4(),
            )),
            endpoints: Arc::new(EndpointRegistry::new()),
            local_queue: queue,
            locks,
            store,
            settings,
            clock,
            node_number: NODE,
            counts: watch::channel(PersistedCounts::default()).0,
        }
    }

    async fn due_envelopes(store: &InMemoryMessageStore, clock: &ManualClock, count: usize) {
        for _ in 0..count {
            let mut envelope = Envelope::incoming("Reminder", Vec::new(), orders(), ANY_NODE, clock.now());
            envelope.schedule_at(clock.now());
            store.schedule_execution(&envelope).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_refused_envelopes_are_released_without_touching_others() {
        let store = InMemoryMessageStore::new();
        let clock = ManualClock::starting_now();
        let in_flight = Envelope::incoming("OrderPlaced", Vec::new(), orders(), NODE, clock.now());
        store.store_incoming(&in_flight).await.unwrap();
        due_envelopes(&store, &clock, 3).await;

        let queue = FakeQueue::new(100, 1);
        let outcome = run(&context(&store, &clock, Arc::clone(&queue))).await.unwrap();

        assert_eq!(outcome, ActionOutcome::Done);
        assert_eq!(queue.taken().len(), 1);

        let pool: Vec<Uuid> = store
            .load_page_of_globally_owned_incoming(&orders(), 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&in_flight.id));
        assert!(!pool.contains(&queue.taken()[0]));
        assert_eq!(store.find_unique_owners().await.unwrap(), vec![NODE]);
        assert_eq!(store.fetch_counts().await.unwrap().scheduled, 0);
    }

    #[tokio::test]
    async fn test_batch_is_bounded_by_queue_capacity() {
        let store = InMemoryMessageStore::new();
        let clock = ManualClock::starting_now();
        due_envelopes(&store, &clock, 5).await;

        let queue = FakeQueue::new(2, 100);
        let outcome = run(&context(&store, &clock, Arc::clone(&queue))).await.unwrap();

        assert_eq!(outcome, ActionOutcome::Reschedule);
        assert_eq!(queue.taken().len(), 2);
        assert_eq!(store.fetch_counts().await.unwrap().scheduled, 3);
    }

    #[tokio::test]
    async fn test_full_queue_leaves_everything_scheduled() {
        let store = InMemoryMessageStore::new();
        let clock = ManualClock::starting_now();
        due_envelopes(&store, &clock, 2).await;

        let queue = FakeQueue::new(0, 100);
        let outcome = run(&context(&store, &clock, Arc::clone(&queue))).await.unwrap();

        assert_eq!(outcome, ActionOutcome::Done);
        assert!(queue.taken().is_empty());
        assert_eq!(store.fetch_counts().await.unwrap().scheduled, 2);
        assert!(store.find_unique_owners().await.unwrap().is_empty());
    }
}
