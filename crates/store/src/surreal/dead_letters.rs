//! Dead-letter operations on SurrealDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::client::{Statement, SurrealMessageStore};
use super::rows::{CountRow, DEAD_LETTER_TABLE, DeadLetterRow, INCOMING_TABLE, IncomingRow, to_millis};
use crate::error::{StoreResult, from_surrealdb_error};
use crate::store::DeadLetters;
use crate::types::{DeadLetterPage, DeadLetterQuery};

/// WHERE clause and bindings for the filters set on a query.
fn dead_letter_filter(query: &DeadLetterQuery) -> (String, Vec<(&'static str, serde_json::Value)>) {
    let mut clauses = Vec::new();
    let mut bindings = Vec::new();

    if let Some(exception_type) = &query.exception_type {
        clauses.push("exception_type = $exception_type");
        bindings.push(("exception_type", serde_json::Value::from(exception_type.clone())));
    }
    if let Some(message_type) = &query.message_type {
        clauses.push("message_type = $message_type");
        bindings.push(("message_type", serde_json::Value::from(message_type.clone())));
    }
    if let Some(from) = query.from {
        clauses.push("sent_at >= $from");
        bindings.push(("from", serde_json::Value::from(to_millis(from))));
    }
    if let Some(until) = query.until {
        clauses.push("sent_at < $until");
        bindings.push(("until", serde_json::Value::from(to_millis(until))));
    }

    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (filter, bindings)
}

#[async_trait]
impl DeadLetters for SurrealMessageStore {
    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> StoreResult<DeadLetterPage> {
        let (filter, bindings) = dead_letter_filter(query);

        let mut request = self.db().query(format!(
            "SELECT * FROM {DEAD_LETTER_TABLE}{filter} ORDER BY sent_at LIMIT $limit START $start;
             SELECT count() AS count FROM {DEAD_LETTER_TABLE}{filter} GROUP ALL;"
        ));
        for (name, value) in bindings {
            request = request.bind((name, value));
        }

        let mut response = request
            .bind(("limit", query.limit))
            .bind(("start", query.offset))
            .await
            .map_err(from_surrealdb_error)?;

        let rows: Vec<DeadLetterRow> = response.take(0).map_err(from_surrealdb_error)?;
        let total: Option<CountRow> = response.take(1).map_err(from_surrealdb_error)?;

        Ok(DeadLetterPage {
            envelopes: rows
                .into_iter()
                .map(DeadLetterRow::into_dead_letter)
                .collect::<StoreResult<_>>()?,
            total: total.map_or(0, |row| row.count),
        })
    }

    async fn mark_dead_letters_replayable(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let marked: Vec<DeadLetterRow> = self
            .db()
            .query(format!(
                "UPDATE {DEAD_LETTER_TABLE} SET replayable = true WHERE envelope_id IN $ids RETURN AFTER"
            ))
            .bind(("ids", ids.iter().map(ToString::to_string).collect::<Vec<_>>()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(marked.len())
    }

    async fn mark_dead_letters_replayable_by_exception(
        &self,
        exception_type: &str,
    ) -> StoreResult<usize> {
        let marked: Vec<DeadLetterRow> = self
            .db()
            .query(format!(
                "UPDATE {DEAD_LETTER_TABLE} SET replayable = true WHERE exception_type = $exception_type RETURN AFTER"
            ))
            .bind(("exception_type", exception_type.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(marked.len())
    }

    async fn replay_dead_letters(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let rows: Vec<DeadLetterRow> = self
            .db()
            .query(format!(
                "SELECT * FROM {DEAD_LETTER_TABLE} WHERE replayable = true AND expires > $now ORDER BY sent_at"
            ))
            .bind(("now", to_millis(now)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        let count = rows.len();
        let mut statements = Vec::with_capacity(count * 2);
        for (i, row) in rows.into_iter().enumerate() {
            let envelope = row.into_dead_letter()?.envelope.into_replay();
            let incoming = IncomingRow::from_envelope(&envelope)?;
            statements.push(
                Statement::new(format!("DELETE type::thing('{DEAD_LETTER_TABLE}', $w{i}_id)"))
                    .bind(format!("w{i}_id"), envelope.id.to_string())?,
            );
            statements.push(
                Statement::new(format!(
                    "UPSERT type::thing('{INCOMING_TABLE}', $w{i}_id) CONTENT $w{i}_row RETURN NONE"
                ))
                .bind(format!("w{i}_row"), incoming)?,
            );
        }

        self.run_transaction(statements).await?;
        Ok(count)
    }

    async fn delete_dead_letters(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let deleted: Vec<DeadLetterRow> = self
            .db()
            .query(format!(
                "DELETE {DEAD_LETTER_TABLE} WHERE envelope_id IN $ids RETURN BEFORE"
            ))
            .bind(("ids", ids.iter().map(ToString::to_string).collect::<Vec<_>>()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(deleted.len())
    }
}
