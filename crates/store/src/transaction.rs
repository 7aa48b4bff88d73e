//! Unit of work binding envelope writes to one backend transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::envelope::Envelope;
use crate::error::StoreResult;

/// Envelope writes staged for one atomic commit.
///
/// Nothing is visible to other readers until [`commit`](Self::commit)
/// succeeds. Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait EnvelopeTransaction: Send {
    /// Stage an outgoing envelope.
    async fn persist_outgoing(&mut self, envelope: &Envelope) -> StoreResult<()>;

    /// Stage several outgoing envelopes.
    async fn persist_outgoing_batch(&mut self, envelopes: &[Envelope]) -> StoreResult<()> {
        for envelope in envelopes {
            self.persist_outgoing(envelope).await?;
        }
        Ok(())
    }

    /// Stage an incoming envelope.
    async fn persist_incoming(&mut self, envelope: &Envelope) -> StoreResult<()>;

    /// Stage the envelope as already handled, returning `false` if its id is
    /// already stored.
    ///
    /// A concurrent writer that stores the same id before this transaction
    /// commits makes the commit fail with a duplicate-envelope error.
    async fn try_make_eager_idempotency_check(
        &mut self,
        envelope: &Envelope,
        keep_until: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Stage marking a stored incoming envelope as handled.
    async fn mark_incoming_handled(
        &mut self,
        envelope: &Envelope,
        keep_until: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Apply every staged write atomically.
    ///
    /// Returns the outgoing envelopes that became visible, for hand-off to
    /// the local send pipeline.
    async fn commit(self: Box<Self>) -> StoreResult<Vec<Envelope>>;

    /// Discard every staged write.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Writes a transaction has staged but not applied.
#[derive(Debug, Clone)]
pub(crate) enum StagedWrite {
    Outgoing(Envelope),
    Incoming(Envelope),
    /// Inserted pre-marked handled; fails on an existing id
    EagerHandled(Envelope),
    /// Marks an existing row handled, inserting it if absent
    MarkHandled(Envelope),
}

impl StagedWrite {
    pub(crate) fn claims_id(&self, id: uuid::Uuid) -> bool {
        match self {
            Self::Incoming(envelope) | Self::EagerHandled(envelope) => envelope.id == id,
            Self::Outgoing(_) | Self::MarkHandled(_) => false,
        }
    }
}
