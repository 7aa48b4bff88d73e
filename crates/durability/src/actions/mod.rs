//! Units of work the durability agent runs.
//!
//! Every action is idempotent: running it twice, or on two nodes at once,
//! never loses or duplicates an envelope. Actions that claim shared work run
//! under a cluster-wide advisory lock and are skipped when another node holds
//! it.

mod expiry;
mod health;
mod reassignment;
mod recover_incoming;
mod recover_outgoing;
mod scheduled;

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::Instrument;
use wharf_core::{Clock, DurabilitySettings, ResultExt};
use wharf_store::{
    AdvisoryLock, INCOMING_MESSAGE_LOCK_ID, MessageStore, OUTGOING_MESSAGE_LOCK_ID,
    PersistedCounts, REASSIGNMENT_LOCK_ID, SCHEDULED_JOB_LOCK_ID,
};

use crate::error::DurabilityResult;
use crate::nodes::{LeaderElection, NodeRegistry};
use crate::transport::{EndpointCollection, LocalQueue};

pub use recover_incoming::determine_page_size;

/// One durability action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentAction {
    /// Claim orphaned incoming envelopes and hand them to their listeners
    RecoverIncoming,
    /// Claim orphaned outgoing envelopes and hand them to their senders
    RecoverOutgoing,
    /// Move due scheduled envelopes to the local queue
    RunScheduledJobs,
    /// Purge handled envelopes and dead letters past retention
    DeleteExpired,
    /// Release envelopes owned by dormant nodes
    ReassignDormantNodes,
    /// Heartbeat, leadership and leader housekeeping
    HealthCheck,
    /// Publish persisted counts
    PublishCounts,
}

impl AgentAction {
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::RecoverIncoming => "recover incoming envelopes",
            Self::RecoverOutgoing => "recover outgoing envelopes",
            Self::RunScheduledJobs => "run scheduled jobs",
            Self::DeleteExpired => "delete expired envelopes",
            Self::ReassignDormantNodes => "reassign envelopes of dormant nodes",
            Self::HealthCheck => "node health check",
            Self::PublishCounts => "publish persisted counts",
        }
    }

    /// Advisory lock serialising this action across the cluster.
    #[must_use]
    pub const fn lock_id(&self) -> Option<i64> {
        match self {
            Self::RecoverIncoming => Some(INCOMING_MESSAGE_LOCK_ID),
            Self::RecoverOutgoing => Some(OUTGOING_MESSAGE_LOCK_ID),
            Self::RunScheduledJobs => Some(SCHEDULED_JOB_LOCK_ID),
            Self::ReassignDormantNodes => Some(REASSIGNMENT_LOCK_ID),
            Self::DeleteExpired | Self::HealthCheck | Self::PublishCounts => None,
        }
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// What the agent should do after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Done,
    /// More work is waiting; run the action again right away
    Reschedule,
    /// Another node holds the lock, or this node is not the leader
    Skipped,
}

/// Everything an action needs from its node.
pub struct AgentContext {
    pub store: Arc<dyn MessageStore>,
    pub locks: Arc<dyn AdvisoryLock>,
    pub endpoints: Arc<dyn EndpointCollection>,
    pub local_queue: Arc<dyn LocalQueue>,
    pub registry: Arc<NodeRegistry>,
    pub leadership: Arc<LeaderElection>,
    pub settings: DurabilitySettings,
    pub clock: Arc<dyn Clock>,
    pub node_number: i32,
    pub counts: watch::Sender<PersistedCounts>,
}

/// Run `action`, taking and releasing its advisory lock.
///
/// # Errors
///
/// Returns the first store or endpoint failure; the lock is released either way.
pub async fn run(action: AgentAction, context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let span = tracing::info_span!("durability_action", node_number = context.node_number, action = %action);
    async move {
        if action == AgentAction::ReassignDormantNodes && !context.leadership.is_leader() {
            tracing::trace!("Not the leader, skipping");
            return Ok(ActionOutcome::Skipped);
        }

        let Some(lock_id) = action.lock_id() else {
            return dispatch(action, context).await;
        };

        if !context.locks.try_attain_lock(lock_id).await? {
            tracing::debug!(lock_id, "Lock held elsewhere, skipping");
            return Ok(ActionOutcome::Skipped);
        }

        let outcome = dispatch(action, context).await;
        let _ = context
            .locks
            .release_lock(lock_id)
            .await
            .into_option_logged("release advisory lock");
        outcome
    }
    .instrument(span)
    .await
}

async fn dispatch(action: AgentAction, context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    match action {
        AgentAction::RecoverIncoming => recover_incoming::run(context).await,
        AgentAction::RecoverOutgoing => recover_outgoing::run(context).await,
        AgentAction::RunScheduledJobs => scheduled::run(context).await,
        AgentAction::DeleteExpired => expiry::run(context).await,
        AgentAction::ReassignDormantNodes => reassignment::run(context).await,
        AgentAction::HealthCheck => health::check(context).await,
        AgentAction::PublishCounts => health::publish_counts(context).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claiming_actions_are_locked() {
        assert_eq!(AgentAction::RecoverIncoming.lock_id(), Some(INCOMING_MESSAGE_LOCK_ID));
        assert_eq!(AgentAction::RunScheduledJobs.lock_id(), Some(SCHEDULED_JOB_LOCK_ID));
        assert_eq!(AgentAction::DeleteExpired.lock_id(), None);
        assert_eq!(AgentAction::HealthCheck.lock_id(), None);
    }

    #[test]
    fn test_display_uses_description() {
        assert_eq!(AgentAction::DeleteExpired.to_string(), "delete expired envelopes");
    }
}
