//! Transport collaborators the durability agent hands work to.
//!
//! Concrete network transports live outside this crate. They plug in through
//! [`TransportFactory`] and the listener/sender traits; the only transport
//! shipped here is `local://`, which delivers in-process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;
use wharf_core::Clock;
use wharf_store::{
    Envelope, EnvelopeStatus, InsertResult, MessageInbox, MessageOutbox, MessageStore,
};

use crate::error::{DurabilityResult, EndpointError};

/// Scheme of the in-process transport.
pub const LOCAL_SCHEME: &str = "local";

/// Whether a listener will take more envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerStatus {
    Accepting,
    /// Queue is at its buffering maximum
    TooBusy,
    /// Stopped or circuit open
    Latched,
}

/// Queue depth bounds of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingLimits {
    /// Depth at which the listener stops accepting
    pub maximum: usize,
    /// Depth at which a busy listener accepts again
    pub restart: usize,
}

impl BufferingLimits {
    #[must_use]
    pub const fn new(maximum: usize, restart: usize) -> Self {
        Self { maximum, restart }
    }
}

impl Default for BufferingLimits {
    fn default() -> Self {
        Self::new(1_000, 500)
    }
}

/// Receives envelopes for one or more destinations.
#[async_trait]
pub trait ListeningAgent: Send + Sync {
    fn status(&self) -> ListenerStatus;

    /// Envelopes waiting in the listener's queue.
    fn queue_count(&self) -> usize;

    fn buffering_limits(&self) -> BufferingLimits;

    /// Hand already-persisted, already-owned envelopes to the listener.
    ///
    /// All or nothing: on error the listener kept none of them.
    async fn enqueue_directly(&self, envelopes: Vec<Envelope>) -> DurabilityResult<()>;
}

/// Sends envelopes to one destination.
#[async_trait]
pub trait SendingAgent: Send + Sync {
    fn destination(&self) -> &Url;

    /// Whether the circuit to the destination is open.
    fn latched(&self) -> bool;

    async fn enqueue_outgoing(&self, envelope: Envelope) -> DurabilityResult<()>;
}

/// Resolves destinations to listeners and senders.
pub trait EndpointCollection: Send + Sync {
    fn find_listener(&self, uri: &Url) -> Option<Arc<dyn ListeningAgent>>;

    /// # Errors
    ///
    /// Returns [`EndpointError::UnknownTransport`] if no transport handles the scheme.
    fn get_or_build_sending_agent(&self, uri: &Url) -> Result<Arc<dyn SendingAgent>, EndpointError>;
}

/// The in-process dispatch pipeline.
#[async_trait]
pub trait LocalQueue: Send + Sync {
    /// Envelopes the queue can take right now; zero once stopped.
    fn capacity(&self) -> usize;

    /// Queue `envelope` without waiting.
    ///
    /// Fails when the queue is full or stopped; the caller still owns the
    /// stored envelope and must release it.
    async fn enqueue(&self, envelope: Envelope) -> DurabilityResult<()>;
}

/// Builds sending agents for one URI scheme.
pub trait TransportFactory: Send + Sync {
    fn build_sending_agent(&self, uri: &Url) -> Arc<dyn SendingAgent>;
}

/// [`EndpointCollection`] keyed by URI, with transports keyed by scheme.
///
/// Sending agents are built on first use and cached per destination.
#[derive(Default)]
pub struct EndpointRegistry {
    listeners: DashMap<Url, Arc<dyn ListeningAgent>>,
    senders: DashMap<Url, Arc<dyn SendingAgent>>,
    transports: DashMap<String, Arc<dyn TransportFactory>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route sends to `scheme://...` through `factory`.
    pub fn register_transport(&self, scheme: impl Into<String>, factory: Arc<dyn TransportFactory>) {
        self.transports.insert(scheme.into(), factory);
    }

    /// Make `listener` responsible for envelopes received at `uri`.
    pub fn add_listener(&self, uri: Url, listener: Arc<dyn ListeningAgent>) {
        self.listeners.insert(uri, listener);
    }

    pub fn remove_listener(&self, uri: &Url) {
        self.listeners.remove(uri);
    }

    /// Drop every listener and cached sender.
    pub fn clear(&self) {
        self.listeners.clear();
        self.senders.clear();
    }

    #[must_use]
    pub fn recognises(&self, uri: &Url) -> bool {
        self.transports.contains_key(uri.scheme())
    }
}

impl EndpointCollection for EndpointRegistry {
    fn find_listener(&self, uri: &Url) -> Option<Arc<dyn ListeningAgent>> {
        self.listeners.get(uri).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_build_sending_agent(&self, uri: &Url) -> Result<Arc<dyn SendingAgent>, EndpointError> {
        if let Some(agent) = self.senders.get(uri) {
            return Ok(Arc::clone(agent.value()));
        }

        let factory = self
            .transports
            .get(uri.scheme())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EndpointError::unknown_transport(uri))?;

        let agent = self
            .senders
            .entry(uri.clone())
            .or_insert_with(|| factory.build_sending_agent(uri));
        Ok(Arc::clone(agent.value()))
    }
}

/// Sender for the `local://` transport.
///
/// Receiving is persisting: the envelope is stored in the inbox owned by
/// this node, handed to the local queue, and only then removed from the
/// outbox. A crash in between leaves both rows, and the resend finds the
/// inbox row already stored.
pub struct LocalSendingAgent {
    destination: Url,
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn LocalQueue>,
    node_number: i32,
    clock: Arc<dyn Clock>,
}

impl LocalSendingAgent {
    #[must_use]
    pub fn new(
        destination: Url,
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn LocalQueue>,
        node_number: i32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            destination,
            store,
            queue,
            node_number,
            clock,
        }
    }
}

#[async_trait]
impl SendingAgent for LocalSendingAgent {
    fn destination(&self) -> &Url {
        &self.destination
    }

    fn latched(&self) -> bool {
        false
    }

    async fn enqueue_outgoing(&self, envelope: Envelope) -> DurabilityResult<()> {
        let outgoing = envelope.clone();
        let mut incoming = envelope;
        incoming.attempts = 0;
        incoming.mark_received(self.destination.clone(), self.node_number, self.clock.now());

        match self.store.store_incoming(&incoming).await? {
            InsertResult::Inserted if incoming.status == EnvelopeStatus::Incoming => {
                if let Err(e) = self.queue.enqueue(incoming.clone()).await {
                    tracing::debug!(
                        envelope_id = %incoming.id,
                        error = %e,
                        "Local queue full, leaving envelope for incoming recovery"
                    );
                    self.store
                        .release_incoming_envelopes(self.node_number, std::slice::from_ref(&incoming))
                        .await?;
                }
            }
            InsertResult::Inserted => {
                tracing::debug!(envelope_id = %incoming.id, "Stored delayed local envelope");
            }
            InsertResult::AlreadyExists => {
                tracing::debug!(envelope_id = %incoming.id, "Local envelope already received");
            }
        }

        self.store.delete_outgoing(&[outgoing]).await?;
        Ok(())
    }
}

/// Builds [`LocalSendingAgent`]s that feed one node's local queue.
pub struct LocalTransport {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn LocalQueue>,
    node_number: i32,
    clock: Arc<dyn Clock>,
}

impl LocalTransport {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn LocalQueue>,
        node_number: i32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            node_number,
            clock,
        }
    }
}

impl TransportFactory for LocalTransport {
    fn build_sending_agent(&self, uri: &Url) -> Arc<dyn SendingAgent> {
        Arc::new(LocalSendingAgent::new(
            uri.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.node_number,
            Arc::clone(&self.clock),
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Mutex;

    use chrono::Duration;
    use wharf_core::ManualClock;
    use wharf_store::{DurabilityOperations, InMemoryMessageStore, MessageStoreAdmin};

    use super::*;

    #[derive(Default)]
    struct RecordingQueue {
        received: Mutex<Vec<Envelope>>,
        full: bool,
    }

    #[async_trait]
    impl LocalQueue for RecordingQueue {
        fn capacity(&self) -> usize {
            if self.full { 0 } else { usize::MAX }
        }

        async fn enqueue(&self, envelope: Envelope) -> DurabilityResult<()> {
            if self.full {
                return Err(crate::error::DurabilityError::not_accepting("recording queue"));
            }
            self.received.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn local(queue: &str) -> Url {
        Url::parse(&format!("local://{queue}")).unwrap()
    }

    fn transport(
        store: &InMemoryMessageStore,
        queue: &Arc<RecordingQueue>,
        clock: &ManualClock,
    ) -> LocalTransport {
        let queue: Arc<dyn LocalQueue> = queue.clone();
        LocalTransport::new(Arc::new(store.clone()), queue, 7, Arc::new(clock.clone()))
    }

    #[test]
    fn test_unknown_scheme_is_distinguishable() {
        let registry = EndpointRegistry::new();
        let result = registry.get_or_build_sending_agent(&Url::parse("smtp://mail").unwrap());
        assert!(matches!(result, Err(EndpointError::UnknownTransport { .. })));
    }

    #[tokio::test]
    async fn test_sending_agents_are_cached_per_destination() {
        let store = InMemoryMessageStore::new();
        let queue = Arc::new(RecordingQueue::default());
        let registry = EndpointRegistry::new();
        registry.register_transport(
            LOCAL_SCHEME,
            Arc::new(transport(&store, &queue, &ManualClock::starting_now())),
        );

        let a = registry.get_or_build_sending_agent(&local("a")).unwrap();
        let again = registry.get_or_build_sending_agent(&local("a")).unwrap();
        let b = registry.get_or_build_sending_agent(&local("b")).unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(registry.recognises(&local("c")));
    }

    #[tokio::test]
    async fn test_local_send_moves_outbox_row_to_inbox() {
        let store = InMemoryMessageStore::new();
        let queue = Arc::new(RecordingQueue::default());
        let clock = ManualClock::starting_now();
        let agent = transport(&store, &queue, &clock).build_sending_agent(&local("orders"));

        let envelope = Envelope::new("OrderPlaced", b"{}".to_vec(), local("orders"));
        store.store_outgoing(&envelope, 7).await.unwrap();
        agent.enqueue_outgoing(envelope.clone()).await.unwrap();

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.outgoing, 0);
        assert_eq!(counts.incoming, 1);
        let received = queue.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].owner_id, 7);

        // A resend after a crash does not deliver twice.
        agent.enqueue_outgoing(envelope).await.unwrap();
        assert_eq!(queue.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_send_to_full_queue_leaves_envelope_for_recovery() {
        let store = InMemoryMessageStore::new();
        let queue = Arc::new(RecordingQueue {
            full: true,
            ..RecordingQueue::default()
        });
        let clock = ManualClock::starting_now();
        let agent = transport(&store, &queue, &clock).build_sending_agent(&local("orders"));

        let envelope = Envelope::new("OrderPlaced", b"{}".to_vec(), local("orders"));
        store.store_outgoing(&envelope, 7).await.unwrap();
        agent.enqueue_outgoing(envelope).await.unwrap();

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.outgoing, 0);
        assert_eq!(counts.incoming, 1);
        let pool = store
            .load_page_of_globally_owned_incoming(&local("orders"), 10)
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_local_send_of_delayed_envelope_is_scheduled() {
        let store = InMemoryMessageStore::new();
        let queue = Arc::new(RecordingQueue::default());
        let clock = ManualClock::starting_now();
        let agent = transport(&store, &queue, &clock).build_sending_agent(&local("orders"));

        let envelope = Envelope::new("Reminder", Vec::new(), local("orders"))
            .delayed(clock.now(), Duration::seconds(30));
        agent.enqueue_outgoing(envelope).await.unwrap();

        assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);
        assert!(queue.received.lock().unwrap().is_empty());
    }
}
