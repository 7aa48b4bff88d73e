//! Envelope transactions committed as one SurrealQL transaction block.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::Surreal;
use surrealdb::engine::any::Any;

use super::client::{Statement, run_transaction};
use super::rows::{INCOMING_TABLE, IncomingRow, OUTGOING_TABLE, OutgoingRow};
use crate::envelope::{Envelope, EnvelopeStatus};
use crate::error::{StoreResult, from_surrealdb_error};
use crate::transaction::{EnvelopeTransaction, StagedWrite};

/// Staged envelope writes plus any caller statements, applied in one
/// `BEGIN`/`COMMIT` block.
///
/// Caller statements run first, in staging order, followed by the envelope
/// writes; a failure anywhere rolls back everything.
pub struct SurrealEnvelopeTransaction {
    db: Arc<Surreal<Any>>,
    statements: Vec<Statement>,
    staged: Vec<StagedWrite>,
}

impl SurrealEnvelopeTransaction {
    pub(crate) fn new(db: Arc<Surreal<Any>>) -> Self {
        Self {
            db,
            statements: Vec::new(),
            staged: Vec::new(),
        }
    }

    /// Stage a business write to commit with the envelopes.
    ///
    /// Binding names must not collide with other staged statements.
    pub fn stage(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    async fn is_stored(&self, envelope: &Envelope) -> StoreResult<bool> {
        let existing: Option<IncomingRow> = self
            .db
            .query(format!(
                "SELECT * FROM type::thing('{INCOMING_TABLE}', $id)"
            ))
            .bind(("id", envelope.id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(existing.is_some())
    }
}

/// Statement applying one staged write; `i` keeps binding names unique.
fn write_statement(i: usize, write: &StagedWrite) -> StoreResult<Statement> {
    let id = format!("w{i}_id");
    let row = format!("w{i}_row");

    match write {
        StagedWrite::Outgoing(envelope) => Statement::new(format!(
            "UPSERT type::thing('{OUTGOING_TABLE}', ${id}) CONTENT ${row} RETURN NONE"
        ))
        .bind(&id, envelope.id.to_string())?
        .bind(&row, OutgoingRow::from_envelope(envelope, envelope.owner_id)?),
        StagedWrite::Incoming(envelope) | StagedWrite::EagerHandled(envelope) => {
            Statement::new(format!(
                "CREATE type::thing('{INCOMING_TABLE}', ${id}) CONTENT ${row} RETURN NONE"
            ))
            .bind(&id, envelope.id.to_string())?
            .bind(&row, IncomingRow::from_envelope(envelope)?)
        }
        StagedWrite::MarkHandled(envelope) => Statement::new(format!(
            "UPSERT type::thing('{INCOMING_TABLE}', ${id}) CONTENT ${row} RETURN NONE"
        ))
        .bind(&id, envelope.id.to_string())?
        .bind(&row, IncomingRow::from_envelope(envelope)?),
    }
}

#[async_trait]
impl EnvelopeTransaction for SurrealEnvelopeTransaction {
    async fn persist_outgoing(&mut self, envelope: &Envelope) -> StoreResult<()> {
        let mut envelope = envelope.clone();
        envelope.status = EnvelopeStatus::Outgoing;
        self.staged.push(StagedWrite::Outgoing(envelope));
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
        if self.is_stored(envelope).await? {
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
        let Self {
            db,
            mut statements,
            staged,
        } = *self;

        for (i, write) in staged.iter().enumerate() {
            statements.push(write_statement(i, write)?);
        }
        run_transaction(&db, statements).await?;

        Ok(staged
            .into_iter()
            .filter_map(|write| match write {
                StagedWrite::Outgoing(envelope) => Some(envelope),
                _ => None,
            })
            .collect())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
