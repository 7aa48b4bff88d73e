//! The envelope: one message in flight and its durable state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::StoreError;

/// Owner id meaning "unowned, available to any node".
pub const ANY_NODE: i32 = 0;

/// Lifecycle status of a stored envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Received and waiting to be handled
    Incoming,
    /// Received but not eligible before its execution time
    Scheduled,
    /// Handled and retained for duplicate detection
    Handled,
    /// Waiting to be sent
    Outgoing,
}

impl EnvelopeStatus {
    /// Stable string form used by the backends.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Scheduled => "scheduled",
            Self::Handled => "handled",
            Self::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Self::Incoming),
            "scheduled" => Ok(Self::Scheduled),
            "handled" => Ok(Self::Handled),
            "outgoing" => Ok(Self::Outgoing),
            other => Err(StoreError::serialization(format!(
                "unknown envelope status '{other}'"
            ))),
        }
    }
}

/// A message and the metadata the store needs to deliver it durably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    /// Stable name used to resolve the payload's handler
    pub message_type: String,
    /// Serialized payload
    pub data: Vec<u8>,
    pub content_type: String,
    pub status: EnvelopeStatus,
    /// Node number responsible for the envelope, or [`ANY_NODE`]
    pub owner_id: i32,
    /// Where the envelope was received (incoming) or must be sent (outgoing)
    pub destination: Url,
    pub source: Option<String>,
    pub attempts: u32,
    /// Execution time of a delayed envelope
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Outgoing envelopes are discarded after this instant
    pub deliver_by: Option<DateTime<Utc>>,
    /// Handled envelopes are retained until this instant
    pub keep_until: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub group_id: Option<String>,
    pub partition_key: Option<String>,
}

impl Envelope {
    /// Create an outgoing envelope for `destination`.
    ///
    /// `sent_at` starts at wall time; the outbox restamps it from the node
    /// clock when the envelope is enlisted.
    #[must_use]
    pub fn new(message_type: impl Into<String>, data: impl Into<Vec<u8>>, destination: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            data: data.into(),
            content_type: "application/json".to_string(),
            status: EnvelopeStatus::Outgoing,
            owner_id: ANY_NODE,
            destination,
            source: None,
            attempts: 0,
            scheduled_time: None,
            deliver_by: None,
            keep_until: None,
            sent_at: Utc::now(),
            received_at: None,
            correlation_id: None,
            conversation_id: None,
            group_id: None,
            partition_key: None,
        }
    }

    /// Create an envelope already received at `destination`.
    #[must_use]
    pub fn incoming(
        message_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
        destination: Url,
        owner_id: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let mut envelope = Self::new(message_type, data, destination.clone());
        envelope.sent_at = now;
        envelope.mark_received(destination, owner_id, now);
        envelope
    }

    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }

    #[must_use]
    pub fn with_deliver_by(mut self, deliver_by: DateTime<Utc>) -> Self {
        self.deliver_by = Some(deliver_by);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_conversation_id(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Delay execution until `now + delay`.
    #[must_use]
    pub fn delayed(mut self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.scheduled_time = Some(now + delay);
        self
    }

    /// Whether the deliver-by watermark has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.is_some_and(|deliver_by| deliver_by <= now)
    }

    /// Whether the envelope must not execute before a later instant.
    #[must_use]
    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|at| at > now)
    }

    /// When the envelope reached its inbox, or when it was sent if no
    /// receipt was recorded.
    #[must_use]
    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.received_at.unwrap_or(self.sent_at)
    }

    /// When a scheduled envelope may run. Without an execution time it is
    /// due from the moment it arrived.
    #[must_use]
    pub fn due_at(&self) -> DateTime<Utc> {
        self.scheduled_time.unwrap_or_else(|| self.arrived_at())
    }

    /// Record receipt at `destination` by `owner_id`.
    ///
    /// Envelopes whose execution time is still ahead become `Scheduled` and
    /// unowned so whichever node is alive at that time can run them.
    pub fn mark_received(&mut self, destination: Url, owner_id: i32, now: DateTime<Utc>) {
        self.destination = destination;
        self.received_at = Some(now);
        if self.is_scheduled_for_later(now) {
            self.status = EnvelopeStatus::Scheduled;
            self.owner_id = ANY_NODE;
        } else {
            self.status = EnvelopeStatus::Incoming;
            self.owner_id = owner_id;
        }
    }

    /// Reschedule the envelope for `time`, releasing ownership.
    pub fn schedule_at(&mut self, time: DateTime<Utc>) {
        self.scheduled_time = Some(time);
        self.status = EnvelopeStatus::Scheduled;
        self.owner_id = ANY_NODE;
    }

    /// Copy of the envelope marked handled and retained until `keep_until`.
    #[must_use]
    pub fn as_handled(&self, keep_until: DateTime<Utc>) -> Self {
        let mut handled = self.clone();
        handled.status = EnvelopeStatus::Handled;
        handled.keep_until = Some(keep_until);
        handled
    }

    /// Reset a dead-lettered envelope for a fresh run through the inbox.
    #[must_use]
    pub fn into_replay(mut self) -> Self {
        self.status = EnvelopeStatus::Incoming;
        self.owner_id = ANY_NODE;
        self.attempts = 0;
        self.scheduled_time = None;
        self.keep_until = None;
        self
    }

    /// Whether the envelope is owned by nobody.
    #[must_use]
    pub const fn is_globally_owned(&self) -> bool {
        self.owner_id == ANY_NODE
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.message_type, self.id, self.destination)
    }
}
