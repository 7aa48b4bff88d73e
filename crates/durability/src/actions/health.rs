use wharf_store::MessageStoreAdmin;

use super::{ActionOutcome, AgentContext};
use crate::error::DurabilityResult;

/// Heartbeat, contend for leadership, and do the leader's housekeeping.
pub(super) async fn check(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    context.registry.heartbeat().await?;

    if !context.leadership.contend(context.node_number).await? {
        return Ok(ActionOutcome::Done);
    }

    let ejected = context.registry.eject_stale_nodes().await?;
    let pruned = context.registry.prune_records().await?;
    if !ejected.is_empty() || pruned > 0 {
        tracing::info!(?ejected, pruned, "Leader housekeeping");
    }
    Ok(ActionOutcome::Done)
}

pub(super) async fn publish_counts(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let counts = context.store.fetch_counts().await?;
    tracing::info!(
        incoming = counts.incoming,
        scheduled = counts.scheduled,
        handled = counts.handled,
        outgoing = counts.outgoing,
        dead_letter = counts.dead_letter,
        "Persisted envelope counts"
    );
    context.counts.send_replace(counts);
    Ok(ActionOutcome::Done)
}
