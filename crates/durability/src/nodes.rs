//! Node registration, heartbeats and leader election.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;
use wharf_core::{Clock, DurabilitySettings, millis};
use wharf_store::{
    AdvisoryLock, LEADERSHIP_LOCK_ID, MessageStore, NodeInfo, NodePersistence, NodeRecord,
    NodeRecordType,
};

use crate::error::{DurabilityError, DurabilityResult};

#[derive(Debug, Clone)]
enum NodeState {
    Unregistered,
    Registered(NodeInfo),
    Deregistered,
}

/// This process's membership in the cluster.
///
/// `Unregistered -> Registered -> Deregistered`; heartbeats are only valid
/// while registered.
pub struct NodeRegistry {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    settings: DurabilitySettings,
    state: RwLock<NodeState>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        settings: DurabilitySettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            state: RwLock::new(NodeState::Unregistered),
        }
    }

    /// Persist `node` and take the node number the store assigns.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is already registered or the store fails.
    pub async fn register(&self, mut node: NodeInfo) -> DurabilityResult<i32> {
        let mut state = self.state.write().await;
        if !matches!(*state, NodeState::Unregistered) {
            return Err(DurabilityError::invalid_node_state(
                "register called more than once",
            ));
        }

        let now = self.clock.now();
        node.started = now;
        node.last_health_check = now;
        let number = self.store.persist_node(&node).await?;
        node.node_number = number;

        self.store
            .log_node_record(&NodeRecord::new(
                number,
                NodeRecordType::NodeStarted,
                now,
                format!("node {} started at {}", node.node_id, node.control_uri),
            ))
            .await?;

        tracing::info!(node_number = number, node_id = %node.node_id, "Node registered");
        *state = NodeState::Registered(node);
        Ok(number)
    }

    /// Record that this node is alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not registered or the store fails.
    pub async fn heartbeat(&self) -> DurabilityResult<()> {
        let mut state = self.state.write().await;
        let NodeState::Registered(node) = &mut *state else {
            return Err(DurabilityError::invalid_node_state(
                "heartbeat requires a registered node",
            ));
        };

        let now = self.clock.now();
        self.store.mark_health_check(node.node_id, now).await?;
        node.last_health_check = now;
        Ok(())
    }

    /// Remove this node from the cluster.
    ///
    /// Deregistering twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the node never registered or the store fails.
    pub async fn deregister(&self) -> DurabilityResult<()> {
        let mut state = self.state.write().await;
        let node = match &*state {
            NodeState::Registered(node) => node.clone(),
            NodeState::Deregistered => return Ok(()),
            NodeState::Unregistered => {
                return Err(DurabilityError::invalid_node_state(
                    "deregister called before register",
                ));
            }
        };

        self.store.delete_node(node.node_id).await?;
        self.store
            .log_node_record(&NodeRecord::new(
                node.node_number,
                NodeRecordType::NodeStopped,
                self.clock.now(),
                format!("node {} stopped", node.node_id),
            ))
            .await?;

        tracing::info!(node_number = node.node_number, "Node deregistered");
        *state = NodeState::Deregistered;
        Ok(())
    }

    /// Claim an agent URI for this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not registered or the store fails.
    pub async fn assign_agent(&self, agent: &Url) -> DurabilityResult<()> {
        let node = self.registered().await?;
        self.store.assign_agent(node.node_id, agent).await?;
        self.store
            .log_node_record(&NodeRecord::new(
                node.node_number,
                NodeRecordType::AgentAssigned,
                self.clock.now(),
                agent.to_string(),
            ))
            .await?;
        Ok(())
    }

    /// Give up an agent URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not registered or the store fails.
    pub async fn remove_agent(&self, agent: &Url) -> DurabilityResult<()> {
        let node = self.registered().await?;
        self.store.remove_agent_assignment(node.node_id, agent).await?;
        self.store
            .log_node_record(&NodeRecord::new(
                node.node_number,
                NodeRecordType::AgentRemoved,
                self.clock.now(),
                agent.to_string(),
            ))
            .await?;
        Ok(())
    }

    async fn registered(&self) -> DurabilityResult<NodeInfo> {
        match &*self.state.read().await {
            NodeState::Registered(node) => Ok(node.clone()),
            _ => Err(DurabilityError::invalid_node_state("node is not registered")),
        }
    }

    /// The assigned node number, once registered.
    pub async fn node_number(&self) -> Option<i32> {
        match &*self.state.read().await {
            NodeState::Registered(node) => Some(node.node_number),
            _ => None,
        }
    }

    pub async fn node(&self) -> Option<NodeInfo> {
        self.registered().await.ok()
    }

    pub async fn is_registered(&self) -> bool {
        matches!(*self.state.read().await, NodeState::Registered(_))
    }

    /// Numbers of nodes whose last heartbeat is within the dormancy threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the node table cannot be read.
    pub async fn live_node_numbers(&self) -> DurabilityResult<HashSet<i32>> {
        let now = self.clock.now();
        let threshold = millis(self.settings.dormant_node_threshold_ms);
        Ok(self
            .store
            .load_all_nodes()
            .await?
            .into_iter()
            .filter(|node| !node.is_dormant(now, threshold))
            .map(|node| node.node_number)
            .collect())
    }

    /// Delete rows of nodes silent for longer than the stale threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if the node table cannot be read or written.
    pub async fn eject_stale_nodes(&self) -> DurabilityResult<Vec<i32>> {
        let own = self.node_number().await;
        let now = self.clock.now();
        let threshold = millis(self.settings.stale_node_row_threshold_ms);

        let mut ejected = Vec::new();
        for node in self.store.load_all_nodes().await? {
            if Some(node.node_number) == own || !node.is_dormant(now, threshold) {
                continue;
            }
            self.store.delete_node(node.node_id).await?;
            self.store
                .log_node_record(&NodeRecord::new(
                    node.node_number,
                    NodeRecordType::DormantNodeEjected,
                    now,
                    format!(
                        "node {} last seen {}",
                        node.node_id, node.last_health_check
                    ),
                ))
                .await?;
            tracing::warn!(
                node_number = node.node_number,
                last_health_check = %node.last_health_check,
                "Ejected stale node"
            );
            ejected.push(node.node_number);
        }
        Ok(ejected)
    }

    /// Drop audit records older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn prune_records(&self) -> DurabilityResult<usize> {
        let cutoff = self.clock.now() - millis(self.settings.node_record_retention_ms);
        Ok(self.store.prune_node_records(cutoff).await?)
    }
}

/// Contends for cluster leadership through [`LEADERSHIP_LOCK_ID`].
pub struct LeaderElection {
    store: Arc<dyn MessageStore>,
    locks: Arc<dyn AdvisoryLock>,
    clock: Arc<dyn Clock>,
    holder: Uuid,
    leader: AtomicBool,
}

impl LeaderElection {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        locks: Arc<dyn AdvisoryLock>,
        clock: Arc<dyn Clock>,
        holder: Uuid,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            holder,
            leader: AtomicBool::new(false),
        }
    }

    /// Whether the last contention won.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Try to take or renew leadership, recording any change.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock or the audit log cannot be reached.
    pub async fn contend(&self, node_number: i32) -> DurabilityResult<bool> {
        let won = self.locks.try_attain_lock(LEADERSHIP_LOCK_ID).await?;
        let was = self.leader.swap(won, Ordering::AcqRel);
        if won != was {
            self.record_transition(node_number, won).await?;
        }
        Ok(won)
    }

    /// Give up leadership if held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub async fn resign(&self, node_number: i32) -> DurabilityResult<()> {
        if self.leader.swap(false, Ordering::AcqRel) {
            self.locks.release_lock(LEADERSHIP_LOCK_ID).await?;
            self.record_transition(node_number, false).await?;
        }
        Ok(())
    }

    async fn record_transition(&self, node_number: i32, leader: bool) -> DurabilityResult<()> {
        let record_type = if leader {
            tracing::info!(node_number, holder = %self.holder, "Assumed leadership");
            NodeRecordType::LeadershipAssumed
        } else {
            tracing::info!(node_number, holder = %self.holder, "Lost leadership");
            NodeRecordType::LeadershipLost
        };
        self.store
            .log_node_record(&NodeRecord::new(
                node_number,
                record_type,
                self.clock.now(),
                format!("holder {}", self.holder),
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Duration;
    use wharf_core::ManualClock;
    use wharf_store::InMemoryMessageStore;

    use super::*;

    fn node() -> NodeInfo {
        NodeInfo::new(Url::parse("local://control").unwrap(), chrono::Utc::now())
    }

    fn registry(store: &InMemoryMessageStore, clock: &ManualClock) -> NodeRegistry {
        NodeRegistry::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            DurabilitySettings::for_testing(),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_is_enforced() {
        let clock = ManualClock::starting_now();
        let store = InMemoryMessageStore::new().with_clock(Arc::new(clock.clone()));
        let registry = registry(&store, &clock);

        assert!(registry.heartbeat().await.is_err());
        assert!(registry.deregister().await.is_err());

        let number = registry.register(node()).await.unwrap();
        assert_eq!(number, 1);
        assert!(registry.register(node()).await.is_err());

        clock.advance(Duration::seconds(5));
        registry.heartbeat().await.unwrap();
        let stored = store.load_all_nodes().await.unwrap();
        assert_eq!(stored[0].last_health_check, clock.now());

        registry.deregister().await.unwrap();
        registry.deregister().await.unwrap();
        assert!(store.load_all_nodes().await.unwrap().is_empty());
        assert!(registry.node_number().await.is_none());

        let records = store.fetch_node_records(10).await.unwrap();
        let types: Vec<_> = records.iter().map(|r| r.record_type).collect();
        assert!(types.contains(&NodeRecordType::NodeStarted));
        assert!(types.contains(&NodeRecordType::NodeStopped));
    }

    #[tokio::test]
    async fn test_live_nodes_exclude_dormant_ones() {
        let clock = ManualClock::starting_now();
        let store = InMemoryMessageStore::new().with_clock(Arc::new(clock.clone()));
        let first = registry(&store, &clock);
        let second = registry(&store, &clock);
        first.register(node()).await.unwrap();
        second.register(node()).await.unwrap();

        clock.advance(Duration::seconds(90));
        second.heartbeat().await.unwrap();

        let live = second.live_node_numbers().await.unwrap();
        assert_eq!(live, HashSet::from([2]));
    }

    #[tokio::test]
    async fn test_stale_rows_are_ejected_but_never_our_own() {
        let clock = ManualClock::starting_now();
        let store = InMemoryMessageStore::new().with_clock(Arc::new(clock.clone()));
        let leader = registry(&store, &clock);
        let silent = registry(&store, &clock);
        leader.register(node()).await.unwrap();
        silent.register(node()).await.unwrap();

        clock.advance(Duration::minutes(30));
        let ejected = leader.eject_stale_nodes().await.unwrap();

        assert_eq!(ejected, vec![2]);
        let remaining = store.load_all_nodes().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node_number, 1);
    }

    #[tokio::test]
    async fn test_leadership_transitions_are_logged() {
        let clock = ManualClock::starting_now();
        let store = InMemoryMessageStore::new().with_clock(Arc::new(clock.clone()));
        let shared: Arc<dyn MessageStore> = Arc::new(store.clone());

        let first_holder = Uuid::new_v4();
        let second_holder = Uuid::new_v4();
        let first = LeaderElection::new(
            Arc::clone(&shared),
            Arc::from(shared.create_advisory_lock(first_holder)),
            Arc::new(clock.clone()),
            first_holder,
        );
        let second = LeaderElection::new(
            Arc::clone(&shared),
            Arc::from(shared.create_advisory_lock(second_holder)),
            Arc::new(clock.clone()),
            second_holder,
        );

        assert!(first.contend(1).await.unwrap());
        assert!(first.contend(1).await.unwrap());
        assert!(!second.contend(2).await.unwrap());

        first.resign(1).await.unwrap();
        assert!(!first.is_leader());
        assert!(second.contend(2).await.unwrap());

        let records = store.fetch_node_records(10).await.unwrap();
        let assumed = records
            .iter()
            .filter(|r| r.record_type == NodeRecordType::LeadershipAssumed)
            .count();
        let lost = records
            .iter()
            .filter(|r| r.record_type == NodeRecordType::LeadershipLost)
            .count();
        assert_eq!(assumed, 2);
        assert_eq!(lost, 1);
    }
}
