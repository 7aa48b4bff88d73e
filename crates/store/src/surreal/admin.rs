//! Administration and durability-agent queries on SurrealDB.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use url::Url;

use super::client::SurrealMessageStore;
use super::rows::{
    ASSIGNMENT_TABLE, CountRow, DEAD_LETTER_TABLE, DeadLetterRow, DestinationCountRow,
    DestinationRow, INCOMING_TABLE, IncomingRow, LOCK_TABLE, NODE_RECORD_TABLE, NODE_TABLE,
    OUTGOING_TABLE, OwnerRow, StatusCountRow, id_strings, parse_url, to_millis,
};
use crate::envelope::{ANY_NODE, Envelope, EnvelopeStatus};
use crate::error::{StoreResult, from_surrealdb_error};
use crate::store::{DurabilityOperations, MessageStoreAdmin};
use crate::types::{IncomingCount, PersistedCounts};

/// Order claimed rows like the envelopes that were offered.
fn in_offered_order(offered: &[Envelope], rows: Vec<IncomingRow>) -> StoreResult<Vec<Envelope>> {
    let mut claimed: HashMap<String, IncomingRow> = rows
        .into_iter()
        .map(|row| (row.envelope_id.clone(), row))
        .collect();

    offered
        .iter()
        .filter_map(|envelope| claimed.remove(&envelope.id.to_string()))
        .map(IncomingRow::into_envelope)
        .collect()
}

#[async_trait]
impl MessageStoreAdmin for SurrealMessageStore {
    async fn fetch_counts(&self) -> StoreResult<PersistedCounts> {
        let mut response = self
            .db()
            .query(format!(
                "SELECT status, count() AS count FROM {INCOMING_TABLE} GROUP BY status;
                 SELECT count() AS count FROM {OUTGOING_TABLE} GROUP ALL;
                 SELECT count() AS count FROM {DEAD_LETTER_TABLE} GROUP ALL;"
            ))
            .await
            .map_err(from_surrealdb_error)?;

        let by_status: Vec<StatusCountRow> = response.take(0).map_err(from_surrealdb_error)?;
        let outgoing: Option<CountRow> = response.take(1).map_err(from_surrealdb_error)?;
        let dead_letter: Option<CountRow> = response.take(2).map_err(from_surrealdb_error)?;

        let mut counts = PersistedCounts {
            outgoing: outgoing.map_or(0, |row| row.count),
            dead_letter: dead_letter.map_or(0, |row| row.count),
            ..PersistedCounts::default()
        };
        for row in by_status {
            match row.status.parse::<EnvelopeStatus>()? {
                EnvelopeStatus::Incoming => counts.incoming = row.count,
                EnvelopeStatus::Scheduled => counts.scheduled = row.count,
                EnvelopeStatus::Handled => counts.handled = row.count,
                EnvelopeStatus::Outgoing => {}
            }
        }
        Ok(counts)
    }

    async fn release_all_ownership(&self, owner_id: Option<i32>) -> StoreResult<()> {
        let filter = if owner_id.is_some() {
            "owner_id = $owner"
        } else {
            "owner_id != $any_node"
        };

        self.db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET owner_id = $any_node WHERE {filter};
                 UPDATE {OUTGOING_TABLE} SET owner_id = $any_node WHERE {filter};"
            ))
            .bind(("any_node", ANY_NODE))
            .bind(("owner", owner_id))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        tracing::info!(?owner_id, "Released envelope ownership");
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        // The node number sequence survives so numbers are never reused.
        self.db()
            .query(format!(
                "DELETE {INCOMING_TABLE};
                 DELETE {OUTGOING_TABLE};
                 DELETE {DEAD_LETTER_TABLE};
                 DELETE {NODE_TABLE};
                 DELETE {ASSIGNMENT_TABLE};
                 DELETE {NODE_RECORD_TABLE};
                 DELETE {LOCK_TABLE};"
            ))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn migrate(&self) -> StoreResult<()> {
        self.initialize_schema().await
    }

    async fn rebuild(&self) -> StoreResult<()> {
        self.initialize_schema().await?;
        self.clear_all().await
    }

    async fn check_connectivity(&self) -> StoreResult<()> {
        self.health_check().await
    }
}

#[async_trait]
impl DurabilityOperations for SurrealMessageStore {
    async fn load_globally_owned_incoming_counts(
        &self,
        received_before: DateTime<Utc>,
    ) -> StoreResult<Vec<IncomingCount>> {
        let rows: Vec<DestinationCountRow> = self
            .db()
            .query(format!(
                "SELECT destination, count() AS count FROM {INCOMING_TABLE} \
                 WHERE owner_id = $any_node AND status = $status AND received_at <= $before \
                 GROUP BY destination"
            ))
            .bind(("any_node", ANY_NODE))
            .bind(("status", EnvelopeStatus::Incoming.to_string()))
            .bind(("before", to_millis(received_before)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter()
            .sorted_by(|a, b| a.destination.cmp(&b.destination))
            .map(|row| {
                Ok(IncomingCount {
                    destination: parse_url(&row.destination)?,
                    count: row.count,
                })
            })
            .collect()
    }

    async fn load_page_of_globally_owned_incoming(
        &self,
        destination: &Url,
        limit: usize,
    ) -> StoreResult<Vec<Envelope>> {
        let rows: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "SELECT * FROM {INCOMING_TABLE} \
                 WHERE owner_id = $any_node AND status = $status AND destination = $destination \
                 ORDER BY received_at LIMIT $limit"
            ))
            .bind(("any_node", ANY_NODE))
            .bind(("status", EnvelopeStatus::Incoming.to_string()))
            .bind(("destination", destination.to_string()))
            .bind(("limit", limit))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter().map(IncomingRow::into_envelope).collect()
    }

    async fn reassign_incoming(
        &self,
        node_number: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<Vec<Envelope>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET owner_id = $node \
                 WHERE envelope_id IN $ids AND owner_id = $any_node AND status = $status \
                 RETURN AFTER"
            ))
            .bind(("node", node_number))
            .bind(("ids", id_strings(envelopes)))
            .bind(("any_node", ANY_NODE))
            .bind(("status", EnvelopeStatus::Incoming.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        in_offered_order(envelopes, rows)
    }

    async fn find_outgoing_destinations(&self) -> StoreResult<Vec<Url>> {
        let rows: Vec<DestinationRow> = self
            .db()
            .query(format!(
                "SELECT destination FROM {OUTGOING_TABLE} WHERE owner_id = $any_node GROUP BY destination"
            ))
            .bind(("any_node", ANY_NODE))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.iter().map(|row| parse_url(&row.destination)).collect()
    }

    async fn load_scheduled_to_execute(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Envelope>> {
        let rows: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "SELECT * FROM {INCOMING_TABLE} \
                 WHERE status = $status AND execution_time <= $now \
                 ORDER BY execution_time LIMIT $limit"
            ))
            .bind(("status", EnvelopeStatus::Scheduled.to_string()))
            .bind(("now", to_millis(now)))
            .bind(("limit", limit))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter().map(IncomingRow::into_envelope).collect()
    }

    async fn reassign_scheduled(
        &self,
        node_number: i32,
        envelopes: &[Envelope],
    ) -> StoreResult<Vec<Envelope>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "UPDATE {INCOMING_TABLE} SET owner_id = $node, status = $incoming \
                 WHERE envelope_id IN $ids AND status = $scheduled \
                 RETURN AFTER"
            ))
            .bind(("node", node_number))
            .bind(("ids", id_strings(envelopes)))
            .bind(("incoming", EnvelopeStatus::Incoming.to_string()))
            .bind(("scheduled", EnvelopeStatus::Scheduled.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        in_offered_order(envelopes, rows)
    }

    async fn delete_expired_handled(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let deleted: Vec<IncomingRow> = self
            .db()
            .query(format!(
                "DELETE {INCOMING_TABLE} WHERE status = $status AND keep_until <= $now RETURN BEFORE"
            ))
            .bind(("status", EnvelopeStatus::Handled.to_string()))
            .bind(("now", to_millis(now)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(deleted.len())
    }

    async fn delete_expired_dead_letters(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let deleted: Vec<DeadLetterRow> = self
            .db()
            .query(format!(
                "DELETE {DEAD_LETTER_TABLE} WHERE expires <= $now RETURN BEFORE"
            ))
            .bind(("now", to_millis(now)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(deleted.len())
    }

    async fn find_unique_owners(&self) -> StoreResult<Vec<i32>> {
        let mut response = self
            .db()
            .query(format!(
                "SELECT owner_id FROM {INCOMING_TABLE} WHERE owner_id != $any_node GROUP BY owner_id;
                 SELECT owner_id FROM {OUTGOING_TABLE} WHERE owner_id != $any_node GROUP BY owner_id;"
            ))
            .bind(("any_node", ANY_NODE))
            .await
            .map_err(from_surrealdb_error)?;

        let incoming: Vec<OwnerRow> = response.take(0).map_err(from_surrealdb_error)?;
        let outgoing: Vec<OwnerRow> = response.take(1).map_err(from_surrealdb_error)?;

        Ok(incoming
            .into_iter()
            .chain(outgoing)
            .map(|row| row.owner_id)
            .unique()
            .sorted()
            .collect())
    }
}
