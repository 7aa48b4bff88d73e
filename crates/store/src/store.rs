//! The message store contract.
//!
//! A backend implements five narrow facets plus the claim surface used by
//! the durability agent. [`MessageStore`] is their union.
//!
//! Every load of "globally owned" work returns only rows owned by
//! [`ANY_NODE`](crate::envelope::ANY_NODE), and every claim is conditional on
//! the row still being unowned, so two nodes racing for the same page never
//! both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{StoreError, StoreResult};
use crate::lock::AdvisoryLock;
use crate::transaction::EnvelopeTransaction;
use crate::types::{
    DeadLetterPage, DeadLetterQuery, ErrorReport, IncomingCount, InsertResult, NodeInfo,
    NodeRecord, PersistedCounts,
};

/// Durable storage for received envelopes.
#[async_trait]
pub trait MessageInbox: Send + Sync {
    /// Store a received envelope; a stored id yields `AlreadyExists`.
    async fn store_incoming(&self, envelope: &Envelope) -> StoreResult<InsertResult>;

    /// Store several received envelopes.
    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> StoreResult<Vec<InsertResult>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            results.push(self.store_incoming(envelope).await?);
        }
        Ok(results)
    }

    /// Persist the envelope as `Scheduled` for its `scheduled_time`, unowned.
    async fn schedule_execution(&self, envelope: &Envelope) -> StoreResult<()>;

    /// Mark envelopes handled, retaining them until `keep_until`.
    async fn mark_incoming_handled(
        &self,
        envelopes: &[Envelope],
        keep_until: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Persist the envelope's current attempt count.
    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> StoreResult<()>;

    /// Remove the envelope from the inbox and store it as a dead letter, atomically.
    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        report: &ErrorReport,
        expires: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Release envelopes owned by `owner_id`, optionally at one destination.
    ///
    /// Returns the number of envelopes released.
    async fn release_incoming(&self, owner_id: i32, destination: Option<&Url>)
    -> StoreResult<usize>;

    /// Release exactly `envelopes`, where they are still incoming and owned
    /// by `owner_id`.
    ///
    /// Returns the number of envelopes released.
    async fn release_incoming_envelopes(
        &self,
        owner_id: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<usize>;
}

/// Durable storage for envelopes waiting to be sent.
#[async_trait]
pub trait MessageOutbox: Send + Sync {
    /// Store an outgoing envelope owned by `owner_id`.
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> StoreResult<()>;

    /// Load unowned outgoing envelopes for `destination`.
    async fn load_outgoing(&self, destination: &Url) -> StoreResult<Vec<Envelope>>;

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> StoreResult<()>;

    /// Delete `discards` and take ownership of `reassigned` in one step.
    ///
    /// Every reassigned envelope must still exist and be unowned or owned by
    /// `node_number`; otherwise nothing changes and the call fails.
    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node_number: i32,
    ) -> StoreResult<()>;
}

/// Terminal storage for envelopes that failed beyond retry.
#[async_trait]
pub trait DeadLetters: Send + Sync {
    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> StoreResult<DeadLetterPage>;

    async fn mark_dead_letters_replayable(&self, ids: &[Uuid]) -> StoreResult<usize>;

    async fn mark_dead_letters_replayable_by_exception(
        &self,
        exception_type: &str,
    ) -> StoreResult<usize>;

    /// Move unexpired replayable dead letters back into the inbox as fresh
    /// unowned incoming envelopes.
    async fn replay_dead_letters(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn delete_dead_letters(&self, ids: &[Uuid]) -> StoreResult<usize>;
}

/// Registry of running nodes and their audit trail.
#[async_trait]
pub trait NodePersistence: Send + Sync {
    /// Store the node and return its newly assigned node number.
    ///
    /// Numbers are sequential, start at 1, and are never reused.
    async fn persist_node(&self, node: &NodeInfo) -> StoreResult<i32>;

    async fn delete_node(&self, node_id: Uuid) -> StoreResult<()>;

    async fn load_all_nodes(&self) -> StoreResult<Vec<NodeInfo>>;

    async fn load_node(&self, node_id: Uuid) -> StoreResult<Option<NodeInfo>>;

    async fn mark_health_check(&self, node_id: Uuid, now: DateTime<Utc>) -> StoreResult<()>;

    async fn assign_agent(&self, node_id: Uuid, agent: &Url) -> StoreResult<()>;

    async fn remove_agent_assignment(&self, node_id: Uuid, agent: &Url) -> StoreResult<()>;

    async fn log_node_record(&self, record: &NodeRecord) -> StoreResult<()>;

    /// Most recent records first.
    async fn fetch_node_records(&self, limit: usize) -> StoreResult<Vec<NodeRecord>>;

    async fn prune_node_records(&self, older_than: DateTime<Utc>) -> StoreResult<usize>;
}

/// Operational surface: counts, provisioning, bulk release.
#[async_trait]
pub trait MessageStoreAdmin: Send + Sync {
    async fn fetch_counts(&self) -> StoreResult<PersistedCounts>;

    /// Release ownership held by one node, or by every node when `None`.
    async fn release_all_ownership(&self, owner_id: Option<i32>) -> StoreResult<()>;

    /// Delete every envelope, dead letter and node row.
    async fn clear_all(&self) -> StoreResult<()>;

    /// Provision the schema if it is missing.
    async fn migrate(&self) -> StoreResult<()>;

    /// Provision the schema and clear all data.
    async fn rebuild(&self) -> StoreResult<()>;

    async fn check_connectivity(&self) -> StoreResult<()>;
}

/// Loads and conditional claims used by the durability agent.
#[async_trait]
pub trait DurabilityOperations: Send + Sync {
    /// Count unowned incoming envelopes received at or before `received_before`, per destination.
    async fn load_globally_owned_incoming_counts(
        &self,
        received_before: DateTime<Utc>,
    ) -> StoreResult<Vec<IncomingCount>>;

    /// Load up to `limit` unowned incoming envelopes for `destination`, oldest first.
    async fn load_page_of_globally_owned_incoming(
        &self,
        destination: &Url,
        limit: usize,
    ) -> StoreResult<Vec<Envelope>>;

    /// Claim the envelopes that are still unowned; returns those claimed.
    async fn reassign_incoming(
        &self,
        node_number: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<Vec<Envelope>>;

    /// Distinct destinations with unowned outgoing envelopes.
    async fn find_outgoing_destinations(&self) -> StoreResult<Vec<Url>>;

    /// Load up to `limit` scheduled envelopes due at `now`, earliest first.
    async fn load_scheduled_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Envelope>>;

    /// Claim still-scheduled envelopes and flip them to `Incoming` in one step.
    async fn reassign_scheduled(
        &self,
        node_number: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<Vec<Envelope>>;

    async fn delete_expired_handled(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Distinct non-zero owner ids across incoming and outgoing envelopes.
    async fn find_unique_owners(&self) -> StoreResult<Vec<i32>>;
}

/// A durable backing store for envelopes and node metadata.
#[async_trait]
pub trait MessageStore:
    MessageInbox + MessageOutbox + DeadLetters + NodePersistence + MessageStoreAdmin + DurabilityOperations
{
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn begin_transaction(&self) -> StoreResult<Box<dyn EnvelopeTransaction>>;

    /// Create an advisory lock session owned by `holder`.
    fn create_advisory_lock(&self, holder: Uuid) -> Box<dyn AdvisoryLock>;

    /// Whether `error` means an incoming envelope id was already stored.
    fn is_duplicate_envelope_error(&self, error: &StoreError) -> bool {
        error.is_duplicate_envelope()
    }
}
