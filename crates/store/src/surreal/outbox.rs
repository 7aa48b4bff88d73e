//! Outbox operations on SurrealDB.

use async_trait::async_trait;
use url::Url;

use super::client::{Statement, SurrealMessageStore};
use super::rows::{OUTGOING_TABLE, OutgoingRow, id_strings};
use crate::envelope::{ANY_NODE, Envelope};
use crate::error::{StoreResult, from_surrealdb_error};
use crate::store::MessageOutbox;

#[async_trait]
impl MessageOutbox for SurrealMessageStore {
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> StoreResult<()> {
        let row = OutgoingRow::from_envelope(envelope, owner_id)?;

        self.db()
            .query(format!(
                "UPSERT type::thing('{OUTGOING_TABLE}', $id) CONTENT $row RETURN NONE"
            ))
            .bind(("id", row.envelope_id.clone()))
            .bind(("row", row))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn load_outgoing(&self, destination: &Url) -> StoreResult<Vec<Envelope>> {
        let rows: Vec<OutgoingRow> = self
            .db()
            .query(format!(
                "SELECT * FROM {OUTGOING_TABLE} WHERE owner_id = $any_node AND destination = $destination ORDER BY sent_at"
            ))
            .bind(("any_node", ANY_NODE))
            .bind(("destination", destination.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter().map(OutgoingRow::into_envelope).collect()
    }

    async fn delete_outgoing(&self, envelopes: &[Envelope]) -> StoreResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        self.db()
            .query(format!("DELETE {OUTGOING_TABLE} WHERE envelope_id IN $ids"))
            .bind(("ids", id_strings(envelopes)))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        node_number: i32,
    ) -> StoreResult<()> {
        // The THROW aborts the whole transaction, including the deletes.
        self.run_transaction(vec![
            Statement::new(format!("DELETE {OUTGOING_TABLE} WHERE envelope_id IN $w0_discards"))
                .bind("w0_discards", id_strings(discards))?,
            Statement::new(format!(
                "LET $w0_moved = (UPDATE {OUTGOING_TABLE} SET owner_id = $w0_node \
                 WHERE envelope_id IN $w0_reassigned AND (owner_id = $w0_any_node OR owner_id = $w0_node) \
                 RETURN AFTER)"
            ))
            .bind("w0_node", node_number)?
            .bind("w0_any_node", ANY_NODE)?
            .bind("w0_reassigned", id_strings(reassigned))?,
            Statement::new(
                "IF array::len($w0_moved) != $w0_expected { THROW \"reassigned outgoing envelopes changed concurrently\" }",
            )
            .bind("w0_expected", reassigned.len())?,
        ])
        .await
    }
}
