//! Named cluster-wide advisory locks.
//!
//! A lock is a lease record keyed by lock id. Acquisition is a
//! compare-and-swap on that record: it succeeds when the record is absent,
//! expired, or already held by the same holder (which renews the lease).
//! A crashed holder therefore loses its locks once the lease runs out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use uuid::Uuid;
use wharf_core::Clock;

use crate::error::StoreResult;

/// Serialises incoming-envelope recovery across the cluster.
pub const INCOMING_MESSAGE_LOCK_ID: i64 = 20_000;
/// Serialises outgoing-envelope recovery across the cluster.
pub const OUTGOING_MESSAGE_LOCK_ID: i64 = 20_001;
/// Serialises scheduled-job execution across the cluster.
pub const SCHEDULED_JOB_LOCK_ID: i64 = 20_002;
/// Serialises dormant-node reassignment across the cluster.
pub const REASSIGNMENT_LOCK_ID: i64 = 20_003;
/// Held by the current cluster leader.
pub const LEADERSHIP_LOCK_ID: i64 = 9_999_999;

/// Default lease of an advisory lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::seconds(60);

/// A mutual-exclusion primitive shared by every node using the same store.
///
/// Implementations track the ids they hold locally; re-attaining a held id
/// renews the lease and returns `true`.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Try to take `lock_id` without waiting.
    async fn try_attain_lock(&self, lock_id: i64) -> StoreResult<bool>;

    /// Release `lock_id` if this holder has it.
    async fn release_lock(&self, lock_id: i64) -> StoreResult<()>;

    /// Whether this holder believes it holds `lock_id`.
    fn has_lock(&self, lock_id: i64) -> bool;

    /// Release every lock this holder has.
    async fn release_all(&self) -> StoreResult<()>;
}

/// Lease record of a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockLease {
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Lease records shared by every in-memory lock created from one store.
pub type LockTable = Arc<DashMap<i64, LockLease>>;

/// Advisory lock over an in-process lease table.
pub struct InMemoryAdvisoryLock {
    holder: Uuid,
    table: LockTable,
    held: DashSet<i64>,
    lease: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryAdvisoryLock {
    /// Create a lock handle for `holder` over `table`.
    #[must_use]
    pub fn new(holder: Uuid, table: LockTable, lease: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            holder,
            table,
            held: DashSet::new(),
            lease,
            clock,
        }
    }

    fn release_held(&self) {
        for lock_id in self.held.iter().map(|id| *id).collect::<Vec<_>>() {
            self.table
                .remove_if(&lock_id, |_, lease| lease.holder == self.holder);
            self.held.remove(&lock_id);
        }
    }
}

#[async_trait]
impl AdvisoryLock for InMemoryAdvisoryLock {
    async fn try_attain_lock(&self, lock_id: i64) -> StoreResult<bool> {
        let now = self.clock.now();
        let lease = LockLease {
            holder: self.holder,
            expires_at: now + self.lease,
        };

        let attained = match self.table.entry(lock_id) {
            Entry::Vacant(entry) => {
                entry.insert(lease);
                true
            }
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current.holder == self.holder || current.expires_at <= now {
                    entry.insert(lease);
                    true
                } else {
                    false
                }
            }
        };

        if attained {
            self.held.insert(lock_id);
        } else {
            self.held.remove(&lock_id);
        }
        Ok(attained)
    }

    async fn release_lock(&self, lock_id: i64) -> StoreResult<()> {
        self.table
            .remove_if(&lock_id, |_, lease| lease.holder == self.holder);
        self.held.remove(&lock_id);
        Ok(())
    }

    fn has_lock(&self, lock_id: i64) -> bool {
        self.held.contains(&lock_id)
    }

    async fn release_all(&self) -> StoreResult<()> {
        self.release_held();
        Ok(())
    }
}

impl Drop for InMemoryAdvisoryLock {
    fn drop(&mut self) {
        self.release_held();
    }
}
