//! Advisory locks as lease records in SurrealDB.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashSet;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use uuid::Uuid;
use wharf_core::Clock;

use super::rows::{LOCK_TABLE, LockRow, to_millis};
use crate::error::{StoreError, StoreResult, from_surrealdb_error};
use crate::lock::AdvisoryLock;

/// Advisory lock session backed by the `wharf_lock` table.
///
/// The record id is the lock id, so two sessions creating the same lock
/// race on one key and only one CREATE succeeds.
pub struct SurrealAdvisoryLock {
    db: Arc<Surreal<Any>>,
    holder: Uuid,
    held: DashSet<i64>,
    lease: Duration,
    clock: Arc<dyn Clock>,
}

impl SurrealAdvisoryLock {
    pub(crate) fn new(
        db: Arc<Surreal<Any>>,
        holder: Uuid,
        lease: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            holder,
            held: DashSet::new(),
            lease,
            clock,
        }
    }

    async fn attain(&self, lock_id: i64) -> StoreResult<bool> {
        let now = to_millis(self.clock.now());
        let expires_at = to_millis(self.clock.now() + self.lease);
        let holder = self.holder.to_string();

        // Clear a lapsed lease, then renew our own.
        let renewed: Vec<LockRow> = self
            .db
            .query(format!(
                "DELETE {LOCK_TABLE} WHERE lock_id = $lock AND expires_at <= $now;
                 UPDATE {LOCK_TABLE} SET expires_at = $expires_at \
                 WHERE lock_id = $lock AND holder = $holder RETURN AFTER;"
            ))
            .bind(("lock", lock_id))
            .bind(("now", now))
            .bind(("expires_at", expires_at))
            .bind(("holder", holder.clone()))
            .await
            .map_err(from_surrealdb_error)?
            .take(1)
            .map_err(from_surrealdb_error)?;

        if !renewed.is_empty() {
            return Ok(true);
        }

        let row = LockRow {
            lock_id,
            holder,
            expires_at,
        };
        let created = self
            .db
            .query(format!(
                "CREATE type::thing('{LOCK_TABLE}', $lock) CONTENT $row RETURN NONE"
            ))
            .bind(("lock", lock_id))
            .bind(("row", row))
            .await
            .map_err(from_surrealdb_error)?
            .check();

        match created.map_err(from_surrealdb_error) {
            Ok(_) => Ok(true),
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

async fn delete_held(db: &Surreal<Any>, holder: String, lock_ids: Vec<i64>) -> StoreResult<()> {
    db.query(format!(
        "DELETE {LOCK_TABLE} WHERE lock_id IN $locks AND holder = $holder"
    ))
    .bind(("locks", lock_ids))
    .bind(("holder", holder))
    .await
    .map_err(from_surrealdb_error)?
    .check()
    .map_err(from_surrealdb_error)?;

    Ok(())
}

#[async_trait]
impl AdvisoryLock for SurrealAdvisoryLock {
    async fn try_attain_lock(&self, lock_id: i64) -> StoreResult<bool> {
        let attained = self.attain(lock_id).await?;
        if attained {
            self.held.insert(lock_id);
        } else {
            self.held.remove(&lock_id);
        }
        Ok(attained)
    }

    async fn release_lock(&self, lock_id: i64) -> StoreResult<()> {
        self.held.remove(&lock_id);
        delete_held(&self.db, self.holder.to_string(), vec![lock_id]).await
    }

    fn has_lock(&self, lock_id: i64) -> bool {
        self.held.contains(&lock_id)
    }

    async fn release_all(&self) -> StoreResult<()> {
        let lock_ids: Vec<i64> = self.held.iter().map(|id| *id).collect();
        self.held.clear();
        if lock_ids.is_empty() {
            return Ok(());
        }
        delete_held(&self.db, self.holder.to_string(), lock_ids).await
    }
}

impl Drop for SurrealAdvisoryLock {
    fn drop(&mut self) {
        let lock_ids: Vec<i64> = self.held.iter().map(|id| *id).collect();
        if lock_ids.is_empty() {
            return;
        }

        // Best effort; the lease expires anyway if no runtime is left.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let db = Arc::clone(&self.db);
            let holder = self.holder.to_string();
            handle.spawn(async move {
                if let Err(e) = delete_held(&db, holder, lock_ids).await {
                    tracing::warn!(error = %e, "Failed to release advisory locks on drop");
                }
            });
        }
    }
}
