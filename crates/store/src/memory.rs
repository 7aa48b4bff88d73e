//! In-memory message store for tests and single-process use.
//!
//! Clones share state, so several simulated nodes can work against one store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;
use wharf_core::{Clock, SystemClock};

use crate::envelope::{ANY_NODE, Envelope, EnvelopeStatus};
use crate::error::{StoreError, StoreResult};
use crate::lock::{AdvisoryLock, DEFAULT_LOCK_LEASE, InMemoryAdvisoryLock, LockTable};
use crate::store::{
    DeadLetters, DurabilityOperations, MessageInbox, MessageOutbox, MessageStore,
    MessageStoreAdmin, NodePersistence,
};
use crate::transaction::{EnvelopeTransaction, StagedWrite};
use crate::types::{
    DeadLetterEnvelope, DeadLetterPage, DeadLetterQuery, ErrorReport, IncomingCount,
    InsertResult, NodeInfo, NodeRecord, PersistedCounts,
};

#[derive(Debug, Default)]
struct StoreState {
    incoming: IndexMap<Uuid, Envelope>,
    outgoing: IndexMap<Uuid, Envelope>,
    dead_letters: IndexMap<Uuid, DeadLetterEnvelope>,
    nodes: IndexMap<Uuid, NodeInfo>,
    /// Agent uri to node id
    assignments: IndexMap<Url, Uuid>,
    node_records: Vec<NodeRecord>,
    last_node_number: i32,
}

impl StoreState {
    fn with_agents(&self, node: &NodeInfo) -> NodeInfo {
        let mut node = node.clone();
        node.active_agents = self
            .assignments
            .iter()
            .filter(|(_, owner)| **owner == node.node_id)
            .map(|(agent, _)| agent.clone())
            .collect();
        node
    }
}

/// Message store holding everything in process memory.
#[derive(Clone)]
pub struct InMemoryMessageStore {
    state: Arc<RwLock<StoreState>>,
    locks: LockTable,
    lock_lease: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    /// Create an empty store using the system clock for lock leases.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            locks: LockTable::default(),
            lock_lease: DEFAULT_LOCK_LEASE,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a new in-memory store wrapped in an Arc.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Use `clock` for lock lease expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the lease of advisory locks created by this store.
    #[must_use]
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Snapshot of a stored incoming envelope.
    pub async fn find_incoming(&self, id: Uuid) -> Option<Envelope> {
        self.state.read().await.incoming.get(&id).cloned()
    }

    /// Snapshot of a stored outgoing envelope.
    pub async fn find_outgoing(&self, id: Uuid) -> Option<Envelope> {
        self.state.read().await.outgoing.get(&id).cloned()
    }

    /// Snapshot of every stored incoming envelope.
    pub async fn all_incoming(&self) -> Vec<Envelope> {
        self.state.read().await.incoming.values().cloned().collect()
    }

    /// Snapshot of every stored outgoing envelope.
    pub async fn all_outgoing(&self) -> Vec<Envelope> {
        self.state.read().await.outgoing.values().cloned().collect()
    }
}

#[async_trait]
impl MessageInbox for InMemoryMessageStore {
    async fn store_incoming(&self, envelope: &Envelope) -> StoreResult<InsertResult> {
        let mut state = self.state.write().await;
        if state.incoming.contains_key(&envelope.id) {
            return Ok(InsertResult::AlreadyExists);
        }
        state.incoming.insert(envelope.id, envelope.clone());
        Ok(InsertResult::Inserted)
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> StoreResult<()> {
        let mut scheduled = envelope.clone();
        scheduled.status = EnvelopeStatus::Scheduled;
        scheduled.owner_id = ANY_NODE;

        let mut state = self.state.write().await;
        state.incoming.insert(scheduled.id, scheduled);
        Ok(())
    }

    async fn mark_incoming_handled(
        &self,
        envelopes: &[Envelope],
        keep_until: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for envelope in envelopes {
            if let Some(stored) = state.incoming.get_mut(&envelope.id) {
                stored.status = EnvelopeStatus::Handled;
                stored.keep_until = Some(keep_until);
            }
        }
        Ok(())
    }

    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.incoming.get_mut(&envelope.id) {
            Some(stored) => {
                stored.attempts = envelope.attempts;
                Ok(())
            }
            None => Err(StoreError::not_found("incoming envelope", envelope.id.to_string())),
        }
    }

    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        report: &ErrorReport,
        expires: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.incoming.shift_remove(&envelope.id);
        state.dead_letters.insert(
            envelope.id,
            DeadLetterEnvelope::new(envelope.clone(), report, expires),
        );
        Ok(())
    }

    async fn release_incoming(
        &self,
        owner_id: i32,
        destination: Option<&Url>,
    ) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let mut released = 0;
        for envelope in state.incoming.values_mut() {
            if envelope.owner_id == owner_id
                && envelope.status == EnvelopeStatus::Incoming
                && destination.is_none_or(|d| envelope.destination == *d)
            {
                envelope.owner_id = ANY_NODE;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_incoming_envelopes(
        &self,
        owner_id: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let mut released = 0;
        for envelope in envelopes {
            let Some(stored) = state.incoming.get_mut(&envelope.id) else {
                continue;
            };
            if stored.owner_id == owner_id && stored.status == EnvelopeStatus::Incoming {
                stored.owner_id = ANY_NODE;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl MessageOutbox for InMemoryMessageStore {
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> StoreResult<()> {
        let mut outgoing = envelope.clone();
        outgoing.status = EnvelopeStatus::Outgoing;
        outgoing.owner_id = owner_id;

        let mut state = self.state.write().await;
        state.outgoing.insert(outgoing.id, outgoing);
        Ok(())
    }

    async fn load_outgoing(&self, destination: &Url) -> StoreResult<Vec<Envelope>> {
        let state = self.state.read().await;
        Ok(state
            .outgoing
            .values()
            .filter(|e| e.is_globally_owned() && e.destination == *destination)
            .cloned()
            .collect())
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for envelope in envelopes {
            state.outgoing.shift_remove(&envelope.id);
        }
        Ok(())
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node_number: i32,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;

        let claimable = reassigned.iter().all(|envelope| {
            state
                .outgoing
                .get(&envelope.id)
                .is_some_and(|stored| stored.owner_id == ANY_NODE || stored.owner_id == node_number)
        });
        if !claimable {
            return Err(StoreError::transaction_failed(
                "reassigned outgoing envelopes changed concurrently",
            ));
        }

        for envelope in discards {
            state.outgoing.shift_remove(&envelope.id);
        }
        for envelope in reassigned {
            if let Some(stored) = state.outgoing.get_mut(&envelope.id) {
                stored.owner_id = node_number;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetters for InMemoryMessageStore {
    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> StoreResult<DeadLetterPage> {
        let state = self.state.read().await;
        let matching = state
            .dead_letters
            .values()
            .filter(|dl| dl.matches(query))
            .sorted_by_key(|dl| dl.sent_at)
            .collect::<Vec<_>>();

        Ok(DeadLetterPage {
            total: matching.len(),
            envelopes: matching
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .cloned()
                .collect(),
        })
    }

    async fn mark_dead_letters_replayable(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for id in ids {
            if let Some(dead_letter) = state.dead_letters.get_mut(id) {
                dead_letter.replayable = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn mark_dead_letters_replayable_by_exception(
        &self,
        exception_type: &str,
    ) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for dead_letter in state.dead_letters.values_mut() {
            if dead_letter.exception_type == exception_type {
                dead_letter.replayable = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn replay_dead_letters(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let replayable = state
            .dead_letters
            .values()
            .filter(|dl| dl.replayable && !dl.is_expired(now))
            .map(DeadLetterEnvelope::id)
            .collect::<Vec<_>>();

        for id in &replayable {
            if let Some(dead_letter) = state.dead_letters.shift_remove(id) {
                let envelope = dead_letter.envelope.into_replay();
                state.incoming.insert(envelope.id, envelope);
            }
        }
        Ok(replayable.len())
    }

    async fn delete_dead_letters(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.dead_letters.shift_remove(id))
            .count())
    }
}

#[async_trait]
impl NodePersistence for InMemoryMessageStore {
    async fn persist_node(&self, node: &NodeInfo) -> StoreResult<i32> {
        let mut state = self.state.write().await;
        state.last_node_number = state.last_node_number.saturating_add(1);
        let mut stored = node.clone();
        stored.node_number = state.last_node_number;
        state.nodes.insert(stored.node_id, stored);
        Ok(state.last_node_number)
    }

    async fn delete_node(&self, node_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.nodes.shift_remove(&node_id);
        state.assignments.retain(|_, owner| *owner != node_id);
        Ok(())
    }

    async fn load_all_nodes(&self) -> StoreResult<Vec<NodeInfo>> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .map(|node| state.with_agents(node))
            .collect())
    }

    async fn load_node(&self, node_id: Uuid) -> StoreResult<Option<NodeInfo>> {
        let state = self.state.read().await;
        Ok(state.nodes.get(&node_id).map(|node| state.with_agents(node)))
    }

    async fn mark_health_check(&self, node_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.nodes.get_mut(&node_id) {
            Some(node) => {
                node.last_health_check = now;
                Ok(())
            }
            None => Err(StoreError::not_found("node", node_id.to_string())),
        }
    }

    async fn assign_agent(&self, node_id: Uuid, agent: &Url) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.assignments.insert(agent.clone(), node_id);
        Ok(())
    }

    async fn remove_agent_assignment(&self, node_id: Uuid, agent: &Url) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.assignments.get(agent) == Some(&node_id) {
            state.assignments.shift_remove(agent);
        }
        Ok(())
    }

    async fn log_node_record(&self, record: &NodeRecord) -> StoreResult<()> {
        self.state.write().await.node_records.push(record.clone());
        Ok(())
    }

    async fn fetch_node_records(&self, limit: usize) -> StoreResult<Vec<NodeRecord>> {
        let state = self.state.read().await;
        Ok(state.node_records.iter().rev().take(limit).cloned().collect())
    }

    async fn prune_node_records(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let before = state.node_records.len();
        state.node_records.retain(|record| record.timestamp >= older_than);
        Ok(before.saturating_sub(state.node_records.len()))
    }
}

#[async_trait]
impl MessageStoreAdmin for InMemoryMessageStore {
    async fn fetch_counts(&self) -> StoreResult<PersistedCounts> {
        let state = self.state.read().await;
        let by_status = state.incoming.values().counts_by(|e| e.status);
        Ok(PersistedCounts {
            incoming: by_status.get(&EnvelopeStatus::Incoming).copied().unwrap_or(0),
            scheduled: by_status.get(&EnvelopeStatus::Scheduled).copied().unwrap_or(0),
            handled: by_status.get(&EnvelopeStatus::Handled).copied().unwrap_or(0),
            outgoing: state.outgoing.len(),
            dead_letter: state.dead_letters.len(),
        })
    }

    async fn release_all_ownership(&self, owner_id: Option<i32>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let StoreState {
            incoming, outgoing, ..
        } = &mut *state;
        for envelope in incoming.values_mut().chain(outgoing.values_mut()) {
            if owner_id.is_none_or(|owner| envelope.owner_id == owner) {
                envelope.owner_id = ANY_NODE;
            }
        }
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let last_node_number = state.last_node_number;
        *state = StoreState {
            last_node_number,
            ..StoreState::default()
        };
        self.locks.clear();
        Ok(())
    }

    async fn migrate(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn rebuild(&self) -> StoreResult<()> {
        self.clear_all().await
    }

    async fn check_connectivity(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DurabilityOperations for InMemoryMessageStore {
    async fn load_globally_owned_incoming_counts(
        &self,
        received_before: DateTime<Utc>,
    ) -> StoreResult<Vec<IncomingCount>> {
        let state = self.state.read().await;
        let counts = state
            .incoming
            .values()
            .filter(|e| e.is_globally_owned() && e.status == EnvelopeStatus::Incoming)
            .filter(|e| e.arrived_at() <= received_before)
            .map(|e| e.destination.clone())
            .counts();

        Ok(counts
            .into_iter()
            .sorted_by(|a, b| a.0.as_str().cmp(b.0.as_str()))
            .map(|(destination, count)| IncomingCount { destination, count })
            .collect())
    }

    async fn load_page_of_globally_owned_incoming(
        &self,
        destination: &Url,
        limit: usize,
    ) -> StoreResult<Vec<Envelope>> {
        let state = self.state.read().await;
        Ok(state
            .incoming
            .values()
            .filter(|e| e.is_globally_owned() && e.status == EnvelopeStatus::Incoming)
            .filter(|e| e.destination == *destination)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reassign_incoming(
        &self,
        node_number: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<Vec<Envelope>> {
        let mut state = self.state.write().await;
        let mut claimed = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let Some(stored) = state.incoming.get_mut(&envelope.id) else {
                continue;
            };
            if stored.is_globally_owned() && stored.status == EnvelopeStatus::Incoming {
                stored.owner_id = node_number;
                claimed.push(stored.clone());
            }
        }
        Ok(claimed)
    }

    async fn find_outgoing_destinations(&self) -> StoreResult<Vec<Url>> {
        let state = self.state.read().await;
        Ok(state
            .outgoing
            .values()
            .filter(|e| e.is_globally_owned())
            .map(|e| e.destination.clone())
            .unique()
            .collect())
    }

    async fn load_scheduled_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Envelope>> {
        let state = self.state.read().await;
        Ok(state
            .incoming
            .values()
            .filter(|e| e.status == EnvelopeStatus::Scheduled && e.due_at() <= now)
            .sorted_by_key(|e| e.due_at())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reassign_scheduled(
        &self,
        node_number: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<Vec<Envelope>> {
        let mut state = self.state.write().await;
        let mut claimed = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let Some(stored) = state.incoming.get_mut(&envelope.id) else {
                continue;
            };
            if stored.status == EnvelopeStatus::Scheduled {
                stored.status = EnvelopeStatus::Incoming;
                stored.owner_id = node_number;
                claimed.push(stored.clone());
            }
        }
        Ok(claimed)
    }

    async fn delete_expired_handled(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let before = state.incoming.len();
        state.incoming.retain(|_, e| {
            !(e.status == EnvelopeStatus::Handled && e.keep_until.is_some_and(|at| at <= now))
        });
        Ok(before.saturating_sub(state.incoming.len()))
    }

    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let before = state.dead_letters.len();
        state.dead_letters.retain(|_, dl| !dl.is_expired(now));
        Ok(before.saturating_sub(state.dead_letters.len()))
    }

    async fn find_unique_owners(&self) -> StoreResult<Vec<i32>> {
        let state = self.state.read().await;
        Ok(state
            .incoming
            .values()
            .chain(state.outgoing.values())
            .map(|e| e.owner_id)
            .filter(|owner| *owner != ANY_NODE)
            .unique()
            .sorted()
            .collect())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn EnvelopeTransaction>> {
        Ok(Box::new(InMemoryEnvelopeTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    fn create_advisory_lock(&self, holder: Uuid) -> Box<dyn AdvisoryLock> {
        Box::new(InMemoryAdvisoryLock::new(
            holder,
            Arc::clone(&self.locks),
            self.lock_lease,
            Arc::clone(&self.clock),
        ))
    }
}

/// Transaction staging writes until commit takes the store's write lock.
pub struct InMemoryEnvelopeTransaction {
    state: Arc<RwLock<StoreState>>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl EnvelopeTransaction for InMemoryEnvelopeTransaction {
    async fn persist_outgoing(&mut self, envelope: &Envelope) -> StoreResult<()> {
        self.staged.push(StagedWrite::Outgoing(envelope.clone()));
        Ok(())
    }

    async fn persist_incoming(&mut self, envelope: &Envelope) -> StoreResult<()> {
        self.staged.push(StagedWrite::Incoming(envelope.clone()));
        Ok(())
    }

    async fn try_make_eager_idempotency_check(
        &mut self,
        envelope: &Envelope,
        keep_until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if self.staged.iter().any(|write| write.claims_id(envelope.id)) {
            return Ok(false);
        }
        if self.state.read().await.incoming.contains_key(&envelope.id) {
            return Ok(false);
        }
        self.staged
            .push(StagedWrite::EagerHandled(envelope.as_handled(keep_until)));
        Ok(true)
    }

    async fn mark_incoming_handled(
        &mut self,
        envelope: &Envelope,
        keep_until: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.staged
            .push(StagedWrite::MarkHandled(envelope.as_handled(keep_until)));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<Vec<Envelope>> {
        let Self { state, staged } = *self;
        let mut state = state.write().await;

        // Validate every insert before applying anything.
        let duplicate = staged.iter().find_map(|write| match write {
            StagedWrite::Incoming(envelope) | StagedWrite::EagerHandled(envelope)
                if state.incoming.contains_key(&envelope.id) =>
            {
                Some(envelope.id)
            }
            _ => None,
        });
        if let Some(id) = duplicate {
            return Err(StoreError::duplicate_envelope(id));
        }

        let mut outgoing = Vec::new();
        for write in staged {
            match write {
                StagedWrite::Outgoing(envelope) => {
                    let mut envelope = envelope;
                    envelope.status = EnvelopeStatus::Outgoing;
                    state.outgoing.insert(envelope.id, envelope.clone());
                    outgoing.push(envelope);
                }
                StagedWrite::Incoming(envelope)
                | StagedWrite::EagerHandled(envelope)
                | StagedWrite::MarkHandled(envelope) => {
                    state.incoming.insert(envelope.id, envelope);
                }
            }
        }
        Ok(outgoing)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn queue() -> Url {
        Url::parse("local://orders").unwrap()
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryMessageStore::new();
        let other = store.clone();
        let envelope = Envelope::incoming("Ping", Vec::new(), queue(), 1, Utc::now());

        store.store_incoming(&envelope).await.unwrap();
        assert!(other.find_incoming(envelope.id).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_node_sequence() {
        let store = InMemoryMessageStore::new();
        let node = NodeInfo::new(Url::parse("tcp://a:1").unwrap(), Utc::now());

        assert_eq!(store.persist_node(&node).await.unwrap(), 1);
        store.clear_all().await.unwrap();
        assert_eq!(store.persist_node(&node).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_page_preserves_insertion_order() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let envelopes = (0..5)
            .map(|_| Envelope::incoming("Ping", Vec::new(), queue(), ANY_NODE, now))
            .collect::<Vec<_>>();
        store.store_incoming_batch(&envelopes).await.unwrap();

        let page = store
            .load_page_of_globally_owned_incoming(&queue(), 3)
            .await
            .unwrap();
        let ids = page.iter().map(|e| e.id).collect::<Vec<_>>();
        let expected = envelopes.iter().take(3).map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids, expected);
    }
}
