use itertools::Itertools;
use wharf_store::{
    DurabilityOperations, MessageStoreAdmin, NodePersistence, NodeRecord, NodeRecordType,
};

use super::{ActionOutcome, AgentContext};
use crate::error::DurabilityResult;

pub(super) async fn run(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let mut live = context.registry.live_node_numbers().await?;
    live.insert(context.node_number);

    let dormant = context
        .store
        .find_unique_owners()
        .await?
        .into_iter()
        .filter(|owner| !live.contains(owner))
        .sorted()
        .collect::<Vec<_>>();

    for owner in dormant {
        context.store.release_all_ownership(Some(owner)).await?;
        context
            .store
            .log_node_record(&NodeRecord::new(
                owner,
                NodeRecordType::OwnershipReleased,
                context.clock.now(),
                format!("released by node {}", context.node_number),
            ))
            .await?;
        tracing::warn!(dormant_node = owner, "Released envelopes of dormant node");
    }
    Ok(ActionOutcome::Done)
}
