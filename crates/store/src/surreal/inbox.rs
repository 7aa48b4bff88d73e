//! Inbox operations on SurrealDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use super::client::{Statement, SurrealMessageStore};
use super::rows::{
    DEAD_LETTER_TABLE, INCOMING_TABLE, IncomingRow, DeadLetterRow, id_strings, to_millis,
};
use crate::envelope::{ANY_NODE, Envelope, EnvelopeStatus};
use crate::error::{StoreError, StoreResult, from_surrealdb_error};
use crate::store::MessageInbox;
use crate::types::{DeadLetterEnvelope, ErrorReport, InsertResult};

#[async_trait]
impl MessageInbox for SurrealMessageStore {
    async fn store_incoming(&self, envelope: &Envelope) -> StoreResult<InsertResult> {
        let row = IncomingRow::from_envelope(envelope)?;

        let result = self
            .db()
            .query(format!(
                "CREATE type::thing('{INCOMING_TABLE}', $id) CONTENT $row RETURN NONE"
            ))
            .bind(("id", row.envelope_id.clone()))
            .bind(("row", row))
            .await
            .map_err(from_surrealdb_error)?
            .check();

        match result.map_err(from_surrealdb_error) {
            Ok(_) => Ok(InsertResult::Inserted),
            Err(StoreError::AlreadyExists { .. }) => Ok(InsertResult::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> StoreResult<()> {
        let mut scheduled = envelope.clone();
        scheduled.status = EnvelopeStatus::Scheduled;
        scheduled.owner_id = ANY_NODE;
        let row = IncomingRow::from_envelope(&scheduled)?;

        self.db()
            .query(format!(
                "UPSERT type::thing('{INCOMING_TABLE}', $id) CONTENT $row RETURN NONE"
            ))
            .bind(("id", row.envelope_id.clone()))
            .bind(("row", row))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn mark_incoming_handled(
        &self,
        envelopes: &[Envelope],
        keep_until: DateTime<Utc>,
    ) -> StoreResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        self.db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET status = $status, keep_until = $keep_until WHERE envelope_id IN $ids"
            ))
            .bind(("status", EnvelopeStatus::Handled.to_string()))
            .bind(("keep_until", to_millis(keep_until)))
            .bind(("ids", id_strings(envelopes)))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn increment_incoming_attempts(&self, envelope: &Envelope) -> StoreResult<()> {
        let updated: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET attempts = $attempts WHERE envelope_id = $id RETURN AFTER"
            ))
            .bind(("attempts", envelope.attempts))
            .bind(("id", envelope.id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        if updated.is_empty() {
            return Err(StoreError::not_found(
                "incoming envelope",
                envelope.id.to_string(),
            ));
        }
        Ok(())
    }

    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        report: &ErrorReport,
        expires: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let row = DeadLetterRow::from_dead_letter(&DeadLetterEnvelope::new(
            envelope.clone(),
            report,
            expires,
        ))?;
        let id = envelope.id.to_string();

        self.run_transaction(vec![
            Statement::new(format!("DELETE type::thing('{INCOMING_TABLE}', $w0_id)"))
                .bind("w0_id", &id)?,
            Statement::new(format!(
                "UPSERT type::thing('{DEAD_LETTER_TABLE}', $w0_id) CONTENT $w0_row RETURN NONE"
            ))
            .bind("w0_row", row)?,
        ])
        .await
    }

    async fn release_incoming(
        &self,
        owner_id: i32,
        destination: Option<&Url>,
    ) -> StoreResult<usize> {
        let filter = if destination.is_some() {
            " AND destination = $destination"
        } else {
            ""
        };

        let released: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET owner_id = $any_node WHERE owner_id = $owner AND status = $status{filter} RETURN AFTER"
            ))
            .bind(("any_node", ANY_NODE))
            .bind(("owner", owner_id))
            .bind(("status", EnvelopeStatus::Incoming.to_string()))
            .bind(("destination", destination.map(ToString::to_string)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(released.len())
    }

    async fn release_incoming_envelopes(
        &self,
        owner_id: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<usize> {
        if envelopes.is_empty() {
            return Ok(0);
        }

        let released: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET owner_id = $any_node \
                 WHERE envelope_id IN $ids AND owner_id = $owner AND status = $status \
                 RETURN AFTER"
            ))
            .bind(("any_node", ANY_NODE))
            .bind(("owner", owner_id))
            .bind(("ids", id_strings(envelopes)))
            .bind(("status", EnvelopeStatus::Incoming.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(released.len())
    }
}
