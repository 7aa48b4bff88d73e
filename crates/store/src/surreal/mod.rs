//! SurrealDB message store.
//!
//! Works against any engine `surrealdb::engine::any` accepts; tests use
//! `mem://`. Multi-statement writes run inside a single transaction block.

mod admin;
mod client;
mod dead_letters;
mod inbox;
mod lock;
mod nodes;
mod outbox;
mod rows;
mod transaction;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

pub use client::{Credentials, Statement, SurrealConfig, SurrealMessageStore};
pub use lock::SurrealAdvisoryLock;
pub use transaction::SurrealEnvelopeTransaction;

use crate::error::StoreResult;
use crate::lock::AdvisoryLock;
use crate::store::MessageStore;
use crate::transaction::EnvelopeTransaction;

impl SurrealMessageStore {
    /// Begin a transaction that also accepts caller [`Statement`]s.
    #[must_use]
    pub fn begin_surreal_transaction(&self) -> SurrealEnvelopeTransaction {
        SurrealEnvelopeTransaction::new(Arc::clone(&self.db))
    }
}

#[async_trait]
impl MessageStore for SurrealMessageStore {
    fn name(&self) -> &str {
        "surrealdb"
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn EnvelopeTransaction>> {
        Ok(Box::new(self.begin_surreal_transaction()))
    }

    fn create_advisory_lock(&self, holder: Uuid) -> Box<dyn AdvisoryLock> {
        Box::new(SurrealAdvisoryLock::new(
            Arc::clone(&self.db),
            holder,
            self.config.lock_lease,
            Arc::clone(&self.clock),
        ))
    }
}
