use wharf_store::DurabilityOperations;

use super::{ActionOutcome, AgentContext};
use crate::error::DurabilityResult;

pub(super) async fn run(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let now = context.clock.now();
    let handled = context.store.delete_expired_handled(now).await?;
    let dead_letters = context.store.delete_expired_dead_letters(now).await?;
    if handled > 0 || dead_letters > 0 {
        tracing::info!(handled, dead_letters, "Deleted expired envelopes");
    }
    Ok(ActionOutcome::Done)
}
