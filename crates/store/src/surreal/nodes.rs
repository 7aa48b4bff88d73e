//! Node registry persistence on SurrealDB.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use super::client::SurrealMessageStore;
use super::rows::{
    ASSIGNMENT_TABLE, AssignmentRow, NODE_RECORD_TABLE, NODE_TABLE, NodeRecordRow, NodeRow,
    SequenceRow, parse_url, to_millis,
};
use crate::error::{StoreError, StoreResult, from_surrealdb_error};
use crate::store::NodePersistence;
use crate::types::{NodeInfo, NodeRecord};

impl SurrealMessageStore {
    /// Take the next node number; numbers are never handed out twice.
    async fn next_node_number(&self) -> StoreResult<i32> {
        let sequence: Option<SequenceRow> = self
            .db()
            .query("UPSERT wharf_sequence:node_number SET last_number += 1 RETURN AFTER")
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        sequence
            .map(|row| row.last_number)
            .ok_or_else(|| StoreError::query_failed("node number sequence returned nothing"))
    }

    async fn load_assignments(&self) -> StoreResult<HashMap<String, Vec<Url>>> {
        let rows: Vec<AssignmentRow> = self
            .db()
            .query(format!("SELECT * FROM {ASSIGNMENT_TABLE}"))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        let mut assignments: HashMap<String, Vec<Url>> = HashMap::new();
        for row in rows {
            assignments
                .entry(row.node_id)
                .or_default()
                .push(parse_url(&row.agent_uri)?);
        }
        Ok(assignments)
    }
}

#[async_trait]
impl NodePersistence for SurrealMessageStore {
    async fn persist_node(&self, node: &NodeInfo) -> StoreResult<i32> {
        let node_number = self.next_node_number().await?;
        let row = NodeRow::from_node(node, node_number);

        self.db()
            .query(format!(
                "CREATE type::thing('{NODE_TABLE}', $id) CONTENT $row RETURN NONE"
            ))
            .bind(("id", row.node_id.clone()))
            .bind(("row", row))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        tracing::debug!(node_id = %node.node_id, node_number, "Persisted node");
        Ok(node_number)
    }

    async fn delete_node(&self, node_id: Uuid) -> StoreResult<()> {
        self.db()
            .query(format!(
                "DELETE {NODE_TABLE} WHERE node_id = $id;
                 DELETE {ASSIGNMENT_TABLE} WHERE node_id = $id;"
            ))
            .bind(("id", node_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn load_all_nodes(&self) -> StoreResult<Vec<NodeInfo>> {
        let rows: Vec<NodeRow> = self
            .db()
            .query(format!("SELECT * FROM {NODE_TABLE} ORDER BY node_number"))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        let mut assignments = self.load_assignments().await?;
        rows.into_iter()
            .map(|row| {
                let agents = assignments.remove(&row.node_id).unwrap_or_default();
                row.into_node(agents)
            })
            .collect()
    }

    async fn load_node(&self, node_id: Uuid) -> StoreResult<Option<NodeInfo>> {
        let row: Option<NodeRow> = self
            .db()
            .query(format!("SELECT * FROM {NODE_TABLE} WHERE node_id = $id"))
            .bind(("id", node_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        match row {
            Some(row) => {
                let agents = self
                    .load_assignments()
                    .await?
                    .remove(&row.node_id)
                    .unwrap_or_default();
                row.into_node(agents).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn mark_health_check(&self, node_id: Uuid, now: DateTime<Utc>) -> StoreResult<()> {
        let updated: Vec<NodeRow> = self
            .db()
            .query(format!(
                "UPDATE {NODE_TABLE} SET health_check = $now WHERE node_id = $id RETURN AFTER"
            ))
            .bind(("now", to_millis(now)))
            .bind(("id", node_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        if updated.is_empty() {
            return Err(StoreError::not_found("node", node_id.to_string()));
        }
        Ok(())
    }

    async fn assign_agent(&self, node_id: Uuid, agent: &Url) -> StoreResult<()> {
        let row = AssignmentRow {
            agent_uri: agent.to_string(),
            node_id: node_id.to_string(),
        };

        self.db()
            .query(format!(
                "UPSERT type::thing('{ASSIGNMENT_TABLE}', $agent) CONTENT $row RETURN NONE"
            ))
            .bind(("agent", row.agent_uri.clone()))
            .bind(("row", row))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn remove_agent_assignment(&self, node_id: Uuid, agent: &Url) -> StoreResult<()> {
        self.db()
            .query(format!(
                "DELETE {ASSIGNMENT_TABLE} WHERE agent_uri = $agent AND node_id = $id"
            ))
            .bind(("agent", agent.to_string()))
            .bind(("id", node_id.to_string()))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn log_node_record(&self, record: &NodeRecord) -> StoreResult<()> {
        self.db()
            .query(format!("CREATE {NODE_RECORD_TABLE} CONTENT $row RETURN NONE"))
            .bind(("row", NodeRecordRow::from_record(record)))
            .await
            .map_err(from_surrealdb_error)?
            .check()
            .map_err(from_surrealdb_error)?;

        Ok(())
    }

    async fn fetch_node_records(&self, limit: usize) -> StoreResult<Vec<NodeRecord>> {
        let rows: Vec<NodeRecordRow> = self
            .db()
            .query(format!(
                "SELECT * FROM {NODE_RECORD_TABLE} ORDER BY timestamp DESC LIMIT $limit"
            ))
            .bind(("limit", limit))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter().map(NodeRecordRow::into_record).collect()
    }

    async fn prune_node_records(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let pruned: Vec<NodeRecordRow> = self
            .db()
            .query(format!(
                "DELETE {NODE_RECORD_TABLE} WHERE timestamp < $cutoff RETURN BEFORE"
            ))
            .bind(("cutoff", to_millis(older_than)))
            .await
            .map_err(from_surrealdb_error)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(pruned.len())
    }
}
