//! Value types exchanged with the message store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::envelope::Envelope;

/// Point-in-time snapshot of stored envelope counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: usize,
    pub scheduled: usize,
    pub handled: usize,
    pub outgoing: usize,
    pub dead_letter: usize,
}

impl PersistedCounts {
    /// Total number of envelopes in any state.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.incoming + self.scheduled + self.handled + self.outgoing + self.dead_letter
    }
}

/// Outcome of storing an incoming envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// An envelope with the same id is already stored
    AlreadyExists,
}

impl InsertResult {
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Number of globally-owned incoming envelopes waiting at a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCount {
    pub destination: Url,
    pub count: usize,
}

/// Error metadata captured when an envelope is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub exception_type: String,
    pub exception_message: String,
}

impl ErrorReport {
    #[must_use]
    pub fn new(exception_type: impl Into<String>, exception_message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            exception_message: exception_message.into(),
        }
    }

    /// Capture an error value, naming it by its Rust type.
    #[must_use]
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }
}

/// An envelope in terminal storage with the failure that put it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub envelope: Envelope,
    pub exception_type: String,
    pub exception_message: String,
    pub sent_at: DateTime<Utc>,
    /// Marked by an administrator for replay into the inbox
    pub replayable: bool,
    pub expires: Option<DateTime<Utc>>,
}

impl DeadLetterEnvelope {
    #[must_use]
    pub fn new(envelope: Envelope, report: &ErrorReport, expires: Option<DateTime<Utc>>) -> Self {
        Self {
            sent_at: envelope.sent_at,
            envelope,
            exception_type: report.exception_type.clone(),
            exception_message: report.exception_message.clone(),
            replayable: false,
            expires,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    /// Whether the retention window has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether the row matches every filter set on `query`.
    #[must_use]
    pub fn matches(&self, query: &DeadLetterQuery) -> bool {
        query
            .exception_type
            .as_ref()
            .is_none_or(|t| *t == self.exception_type)
            && query
                .message_type
                .as_ref()
                .is_none_or(|t| *t == self.envelope.message_type)
            && query.from.is_none_or(|from| self.sent_at >= from)
            && query.until.is_none_or(|until| self.sent_at < until)
    }
}

/// Filters and paging for dead-letter queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterQuery {
    pub exception_type: Option<String>,
    pub message_type: Option<String>,
    /// Inclusive lower bound on `sent_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `sent_at`
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self {
            exception_type: None,
            message_type: None,
            from: None,
            until: None,
            offset: 0,
            limit: 100,
        }
    }
}

impl DeadLetterQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_exception_type(mut self, exception_type: impl Into<String>) -> Self {
        self.exception_type = Some(exception_type.into());
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    #[must_use]
    pub fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// One page of dead letters and the total matching the filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterPage {
    pub envelopes: Vec<DeadLetterEnvelope>,
    pub total: usize,
}

/// A running process instance taking part in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: Uuid,
    /// Sequential number assigned at registration; used as envelope owner id
    pub node_number: i32,
    pub description: String,
    pub control_uri: Url,
    pub version: String,
    pub capabilities: Vec<String>,
    pub active_agents: Vec<Url>,
    pub started: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
}

impl NodeInfo {
    /// Describe a node starting at `now`; the number is assigned on persist.
    #[must_use]
    pub fn new(control_uri: Url, now: DateTime<Utc>) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            node_number: 0,
            description: String::new(),
            control_uri,
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Vec::new(),
            active_agents: Vec::new(),
            started: now,
            last_health_check: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether the last heartbeat is older than `threshold`.
    #[must_use]
    pub fn is_dormant(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_health_check > threshold
    }
}

/// Kinds of node lifecycle audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRecordType {
    NodeStarted,
    NodeStopped,
    LeadershipAssumed,
    LeadershipLost,
    DormantNodeEjected,
    AgentAssigned,
    AgentRemoved,
    OwnershipReleased,
}

/// Append-only audit entry for a node lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_number: i32,
    pub record_type: NodeRecordType,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl NodeRecord {
    #[must_use]
    pub fn new(
        node_number: i32,
        record_type: NodeRecordType,
        timestamp: DateTime<Utc>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            node_number,
            record_type,
            timestamp,
            description: description.into(),
        }
    }
}
