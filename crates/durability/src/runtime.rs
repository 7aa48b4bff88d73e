//! Wiring of one durable node.
//!
//! [`DurableNode::builder`] registers the node, builds its endpoint
//! registry, local delivery queue and publisher, and starts the durability
//! agent.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use url::Url;
use uuid::Uuid;
use wharf_core::{Clock, DurabilitySettings, SystemClock};
use wharf_store::{AdvisoryLock, Envelope, MessageStore, NodeInfo, PersistedCounts};

use crate::actions::{ActionOutcome, AgentAction, AgentContext};
use crate::agent::DurabilityAgent;
use crate::delivery::{DeliveryOutcome, LocalDeliveryQueue};
use crate::error::{DurabilityError, DurabilityResult};
use crate::handlers::HandlerRegistry;
use crate::nodes::{LeaderElection, NodeRegistry};
use crate::outbox::Publisher;
use crate::transport::{
    BufferingLimits, EndpointCollection, EndpointRegistry, LOCAL_SCHEME, ListeningAgent,
    LocalQueue, LocalTransport, TransportFactory,
};

/// Receiver of `(envelope id, outcome)` for every local delivery.
pub type DeliveryObserver = mpsc::UnboundedSender<(Uuid, DeliveryOutcome)>;

/// Configures and starts a [`DurableNode`].
#[must_use]
pub struct DurableNodeBuilder {
    store: Arc<dyn MessageStore>,
    settings: DurabilitySettings,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    control_uri: Option<Url>,
    description: String,
    local_queues: Vec<Url>,
    transports: Vec<(String, Arc<dyn TransportFactory>)>,
    limits: BufferingLimits,
    observer: Option<DeliveryObserver>,
    start_agent: bool,
}

impl DurableNodeBuilder {
    pub fn with_settings(mut self, settings: DurabilitySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_control_uri(mut self, uri: Url) -> Self {
        self.control_uri = Some(uri);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Receive envelopes sent to `uri` on this node's delivery queue.
    pub fn with_local_queue(mut self, uri: Url) -> Self {
        self.local_queues.push(uri);
        self
    }

    pub fn with_transport(mut self, scheme: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports.push((scheme.into(), factory));
        self
    }

    pub fn with_buffering_limits(mut self, limits: BufferingLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_delivery_observer(mut self, observer: DeliveryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Leave the timers off; actions run only through [`DurableNode::execute`].
    pub fn without_timers(mut self) -> Self {
        self.start_agent = false;
        self
    }

    /// Register the node and start it.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or registration fails.
    pub async fn start(self) -> DurabilityResult<DurableNode> {
        let settings = self.settings.validate()?;
        let store = self.store;
        let clock = self.clock;

        let control_uri = match self.control_uri {
            Some(uri) => uri,
            None => control_uri_for(Uuid::new_v4())?,
        };
        let info = NodeInfo::new(control_uri, clock.now()).with_description(self.description);
        let node_id = info.node_id;

        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            settings.clone(),
        ));
        let node_number = registry.register(info).await?;

        let endpoints = Arc::new(EndpointRegistry::new());
        for (scheme, factory) in self.transports {
            endpoints.register_transport(scheme, factory);
        }

        let endpoint_collection: Arc<dyn EndpointCollection> = endpoints.clone();
        let publisher = Publisher::new(
            Arc::clone(&store),
            endpoint_collection,
            node_number,
            Arc::clone(&clock),
        );
        let queue = LocalDeliveryQueue::start_observed(
            Arc::clone(&store),
            self.handlers,
            publisher.clone(),
            settings.clone(),
            Arc::clone(&clock),
            self.limits,
            self.observer,
        );

        let local_queue: Arc<dyn LocalQueue> = queue.clone();
        endpoints.register_transport(
            LOCAL_SCHEME,
            Arc::new(LocalTransport::new(
                Arc::clone(&store),
                Arc::clone(&local_queue),
                node_number,
                Arc::clone(&clock),
            )),
        );
        let listener: Arc<dyn ListeningAgent> = queue.clone();
        for uri in &self.local_queues {
            endpoints.add_listener(uri.clone(), Arc::clone(&listener));
            registry.assign_agent(uri).await?;
        }

        let locks: Arc<dyn AdvisoryLock> = Arc::from(store.create_advisory_lock(node_id));
        let leadership = Arc::new(LeaderElection::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&clock),
            node_id,
        ));
        let (counts, _) = watch::channel(PersistedCounts::default());

        let agent = DurabilityAgent::new(AgentContext {
            store: Arc::clone(&store),
            locks,
            endpoints: endpoints.clone(),
            local_queue,
            registry: Arc::clone(&registry),
            leadership,
            settings,
            clock,
            node_number,
            counts,
        });
        if self.start_agent {
            agent.start().await?;
        }

        tracing::info!(node_number, store = store.name(), "Durable node started");
        Ok(DurableNode {
            node_id,
            node_number,
            store,
            endpoints,
            queue,
            publisher,
            registry,
            agent,
        })
    }
}

fn control_uri_for(node_id: Uuid) -> DurabilityResult<Url> {
    Url::parse(&format!("local://node-{node_id}"))
        .map_err(|e| DurabilityError::invalid_node_state(format!("control uri: {e}")))
}

/// A registered node with its delivery queue and durability agent.
pub struct DurableNode {
    node_id: Uuid,
    node_number: i32,
    store: Arc<dyn MessageStore>,
    endpoints: Arc<EndpointRegistry>,
    queue: Arc<LocalDeliveryQueue>,
    publisher: Publisher,
    registry: Arc<NodeRegistry>,
    agent: DurabilityAgent,
}

impl DurableNode {
    pub fn builder(store: Arc<dyn MessageStore>) -> DurableNodeBuilder {
        DurableNodeBuilder {
            store,
            settings: DurabilitySettings::default(),
            clock: Arc::new(SystemClock),
            handlers: HandlerRegistry::new(),
            control_uri: None,
            description: String::new(),
            local_queues: Vec::new(),
            transports: Vec::new(),
            limits: BufferingLimits::default(),
            observer: None,
            start_agent: true,
        }
    }

    #[must_use]
    pub const fn node_id(&self) -> Uuid {
        self.node_id
    }

    #[must_use]
    pub const fn node_number(&self) -> i32 {
        self.node_number
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    #[must_use]
    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    #[must_use]
    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    #[must_use]
    pub const fn agent(&self) -> &DurabilityAgent {
        &self.agent
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn counts(&self) -> watch::Receiver<PersistedCounts> {
        self.agent.counts()
    }

    /// Durably send `envelopes` through the outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox commit fails.
    pub async fn publish(&self, envelopes: Vec<Envelope>) -> DurabilityResult<()> {
        self.publisher.publish(envelopes).await
    }

    /// Deliver an unpersisted envelope locally, at most once per id.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery queue is stopped.
    pub async fn send_buffered(&self, envelope: Envelope) -> DurabilityResult<()> {
        self.queue.enqueue_buffered(envelope).await
    }

    /// Run one durability action inline.
    ///
    /// # Errors
    ///
    /// Returns the action's failure.
    pub async fn execute(&self, action: AgentAction) -> DurabilityResult<ActionOutcome> {
        self.agent.execute(action).await
    }

    /// Drain the delivery queue, stop the agent and leave the cluster.
    ///
    /// # Errors
    ///
    /// Returns the first cleanup failure.
    pub async fn stop(&self) -> DurabilityResult<()> {
        self.queue.stop().await;
        self.agent.stop().await?;
        self.endpoints.clear();
        Ok(())
    }

    /// Stop every task without cleanup, as a crash would.
    pub async fn abort(&self) {
        self.queue.abort();
        self.agent.abort().await;
    }
}
