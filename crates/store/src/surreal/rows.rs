//! Row shapes stored in SurrealDB.
//!
//! Timestamps are epoch milliseconds; an absent deadline is stored as
//! [`NEVER`] so range comparisons need no NONE handling. The full envelope
//! is kept as a JSON body next to the columns queries filter on. Columns
//! that updates rewrite in place win when a row is read back; derived
//! columns such as `execution_time` only serve queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeStatus};
use crate::error::{StoreError, StoreResult};
use crate::types::{DeadLetterEnvelope, NodeInfo, NodeRecord, NodeRecordType};

pub(crate) const INCOMING_TABLE: &str = "wharf_incoming";
pub(crate) const OUTGOING_TABLE: &str = "wharf_outgoing";
pub(crate) const DEAD_LETTER_TABLE: &str = "wharf_dead_letter";
pub(crate) const NODE_TABLE: &str = "wharf_node";
pub(crate) const ASSIGNMENT_TABLE: &str = "wharf_node_assignment";
pub(crate) const NODE_RECORD_TABLE: &str = "wharf_node_record";
pub(crate) const LOCK_TABLE: &str = "wharf_lock";

/// Sentinel for "no deadline".
pub(crate) const NEVER: i64 = i64::MAX;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn optional_millis(at: Option<DateTime<Utc>>) -> i64 {
    at.map_or(NEVER, to_millis)
}

pub(crate) fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::serialization(format!("timestamp out of range: {ms}")))
}

pub(crate) fn from_optional_millis(ms: i64) -> StoreResult<Option<DateTime<Utc>>> {
    if ms == NEVER {
        Ok(None)
    } else {
        from_millis(ms).map(Some)
    }
}

pub(crate) fn parse_url(raw: &str) -> StoreResult<Url> {
    Url::parse(raw).map_err(|e| StoreError::serialization(format!("invalid uri '{raw}': {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::serialization(format!("invalid id '{raw}': {e}")))
}

/// Ids as the strings used for record keys and `IN` filters.
pub(crate) fn id_strings<'a>(envelopes: impl IntoIterator<Item = &'a Envelope>) -> Vec<String> {
    envelopes.into_iter().map(|e| e.id.to_string()).collect()
}

/// Scheduled rows without an execution time are due from arrival.
fn execution_millis(envelope: &Envelope) -> i64 {
    if envelope.status == EnvelopeStatus::Scheduled {
        to_millis(envelope.due_at())
    } else {
        optional_millis(envelope.scheduled_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IncomingRow {
    pub envelope_id: String,
    pub body: String,
    pub status: String,
    pub owner_id: i32,
    pub message_type: String,
    pub destination: String,
    pub execution_time: i64,
    pub attempts: u32,
    pub keep_until: i64,
    pub received_at: i64,
}

impl IncomingRow {
    pub(crate) fn from_envelope(envelope: &Envelope) -> StoreResult<Self> {
        Ok(Self {
            envelope_id: envelope.id.to_string(),
            body: serde_json::to_string(envelope)?,
            status: envelope.status.to_string(),
            owner_id: envelope.owner_id,
            message_type: envelope.message_type.clone(),
            destination: envelope.destination.to_string(),
            execution_time: execution_millis(envelope),
            attempts: envelope.attempts,
            keep_until: optional_millis(envelope.keep_until),
            received_at: to_millis(envelope.arrived_at()),
        })
    }

    pub(crate) fn into_envelope(self) -> StoreResult<Envelope> {
        let mut envelope: Envelope = serde_json::from_str(&self.body)?;
        envelope.status = self.status.parse::<EnvelopeStatus>()?;
        envelope.owner_id = self.owner_id;
        envelope.attempts = self.attempts;
        envelope.keep_until = from_optional_millis(self.keep_until)?;
        Ok(envelope)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OutgoingRow {
    pub envelope_id: String,
    pub body: String,
    pub owner_id: i32,
    pub destination: String,
    pub message_type: String,
    pub deliver_by: i64,
    pub attempts: u32,
    pub sent_at: i64,
}

impl OutgoingRow {
    pub(crate) fn from_envelope(envelope: &Envelope, owner_id: i32) -> StoreResult<Self> {
        Ok(Self {
            envelope_id: envelope.id.to_string(),
            body: serde_json::to_string(envelope)?,
            owner_id,
            destination: envelope.destination.to_string(),
            message_type: envelope.message_type.clone(),
            deliver_by: optional_millis(envelope.deliver_by),
            attempts: envelope.attempts,
            sent_at: to_millis(envelope.sent_at),
        })
    }

    pub(crate) fn into_envelope(self) -> StoreResult<Envelope> {
        let mut envelope: Envelope = serde_json::from_str(&self.body)?;
        envelope.status = EnvelopeStatus::Outgoing;
        envelope.owner_id = self.owner_id;
        envelope.attempts = self.attempts;
        Ok(envelope)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DeadLetterRow {
    pub envelope_id: String,
    pub body: String,
    pub message_type: String,
    pub received_at: String,
    pub source: Option<String>,
    pub exception_type: String,
    pub exception_message: String,
    pub sent_at: i64,
    pub replayable: bool,
    pub expires: i64,
}

impl DeadLetterRow {
    pub(crate) fn from_dead_letter(dead_letter: &DeadLetterEnvelope) -> StoreResult<Self> {
        let envelope = &dead_letter.envelope;
        Ok(Self {
            envelope_id: envelope.id.to_string(),
            body: serde_json::to_string(envelope)?,
            message_type: envelope.message_type.clone(),
            received_at: envelope.destination.to_string(),
            source: envelope.source.clone(),
            exception_type: dead_letter.exception_type.clone(),
            exception_message: dead_letter.exception_message.clone(),
            sent_at: to_millis(dead_letter.sent_at),
            replayable: dead_letter.replayable,
            expires: optional_millis(dead_letter.expires),
        })
    }

    pub(crate) fn into_dead_letter(self) -> StoreResult<DeadLetterEnvelope> {
        Ok(DeadLetterEnvelope {
            envelope: serde_json::from_str(&self.body)?,
            exception_type: self.exception_type,
            exception_message: self.exception_message,
            sent_at: from_millis(self.sent_at)?,
            replayable: self.replayable,
            expires: from_optional_millis(self.expires)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeRow {
    pub node_id: String,
    pub node_number: i32,
    pub description: String,
    pub uri: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub started: i64,
    pub health_check: i64,
}

impl NodeRow {
    pub(crate) fn from_node(node: &NodeInfo, node_number: i32) -> Self {
        Self {
            node_id: node.node_id.to_string(),
            node_number,
            description: node.description.clone(),
            uri: node.control_uri.to_string(),
            version: node.version.clone(),
            capabilities: node.capabilities.clone(),
            started: to_millis(node.started),
            health_check: to_millis(node.last_health_check),
        }
    }

    pub(crate) fn into_node(self, active_agents: Vec<Url>) -> StoreResult<NodeInfo> {
        Ok(NodeInfo {
            node_id: parse_uuid(&self.node_id)?,
            node_number: self.node_number,
            description: self.description,
            control_uri: parse_url(&self.uri)?,
            version: self.version,
            capabilities: self.capabilities,
            active_agents,
            started: from_millis(self.started)?,
            last_health_check: from_millis(self.health_check)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AssignmentRow {
    pub agent_uri: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeRecordRow {
    pub node_number: i32,
    pub record_type: NodeRecordType,
    pub timestamp: i64,
    pub description: String,
}

impl NodeRecordRow {
    pub(crate) fn from_record(record: &NodeRecord) -> Self {
        Self {
            node_number: record.node_number,
            record_type: record.record_type,
            timestamp: to_millis(record.timestamp),
            description: record.description.clone(),
        }
    }

    pub(crate) fn into_record(self) -> StoreResult<NodeRecord> {
        Ok(NodeRecord {
            node_number: self.node_number,
            record_type: self.record_type,
            timestamp: from_millis(self.timestamp)?,
            description: self.description,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LockRow {
    pub lock_id: i64,
    pub holder: String,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CountRow {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusCountRow {
    pub status: String,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DestinationCountRow {
    pub destination: String,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DestinationRow {
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OwnerRow {
    pub owner_id: i32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SequenceRow {
    pub last_number: i32,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Duration;

    use super::*;

    #[test]
    fn test_incoming_row_columns_win_over_body() {
        let now = Utc::now();
        let envelope = Envelope::incoming("Ping", b"x".to_vec(), Url::parse("local://q").unwrap(), 4, now);
        let mut row = IncomingRow::from_envelope(&envelope).unwrap();
        row.owner_id = 0;
        row.attempts = 2;
        row.status = "scheduled".to_string();

        let restored = row.into_envelope().unwrap();
        assert_eq!(restored.owner_id, 0);
        assert_eq!(restored.attempts, 2);
        assert_eq!(restored.status, EnvelopeStatus::Scheduled);
        assert_eq!(restored.data, b"x".to_vec());
    }

    #[test]
    fn test_scheduled_row_without_time_is_due_from_arrival() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let mut envelope = Envelope::incoming("Ping", Vec::new(), Url::parse("local://q").unwrap(), 4, now);
        envelope.status = EnvelopeStatus::Scheduled;

        let row = IncomingRow::from_envelope(&envelope).unwrap();
        assert_eq!(row.execution_time, to_millis(now));

        let restored = row.into_envelope().unwrap();
        assert_eq!(restored.scheduled_time, None);
    }

    #[test]
    fn test_absent_deadlines_use_sentinel() {
        let envelope = Envelope::new("Ping", Vec::new(), Url::parse("local://q").unwrap());
        let row = OutgoingRow::from_envelope(&envelope, 1).unwrap();
        assert_eq!(row.deliver_by, NEVER);
        assert_eq!(from_optional_millis(NEVER).unwrap(), None);
    }

    #[test]
    fn test_millis_round_trip_truncates_to_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
        assert_eq!(
            from_optional_millis(optional_millis(Some(at + Duration::seconds(1)))).unwrap(),
            Some(at + Duration::seconds(1))
        );
    }
}
