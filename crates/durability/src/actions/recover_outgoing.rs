use wharf_store::{ANY_NODE, DurabilityOperations, Envelope, MessageOutbox};

use super::{ActionOutcome, AgentContext};
use crate::error::DurabilityResult;

pub(super) async fn run(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let now = context.clock.now();
    let batch_size = context.settings.recovery_batch_size;
    let mut outcome = ActionOutcome::Done;

    for destination in context.store.find_outgoing_destinations().await? {
        let agent = match context.endpoints.get_or_build_sending_agent(&destination) {
            Ok(agent) => agent,
            Err(e) => {
                let backlog = context.store.load_outgoing(&destination).await?;
                tracing::error!(
                    %destination,
                    error = %e,
                    discarded = backlog.len(),
                    "Unknown transport, deleting outgoing backlog"
                );
                context.store.delete_outgoing(&backlog).await?;
                continue;
            }
        };

        if agent.latched() {
            tracing::debug!(%destination, "Sending agent latched, leaving backlog");
            continue;
        }

        let mut envelopes = context.store.load_outgoing(&destination).await?;
        if envelopes.len() > batch_size {
            envelopes.truncate(batch_size);
            outcome = ActionOutcome::Reschedule;
        }

        let (expired, valid): (Vec<Envelope>, Vec<Envelope>) =
            envelopes.into_iter().partition(|e| e.is_expired(now));

        if let Err(e) = context
            .store
            .discard_and_reassign_outgoing(&expired, &valid, context.node_number)
            .await
        {
            // Another node got there first; nothing changed.
            tracing::warn!(%destination, error = %e, "Outgoing reassignment rolled back");
            continue;
        }

        if !expired.is_empty() {
            tracing::info!(%destination, discarded = expired.len(), "Discarded expired outgoing envelopes");
        }
        tracing::info!(%destination, recovered = valid.len(), "Recovered outgoing envelopes");

        for mut envelope in valid {
            envelope.owner_id = context.node_number;
            let retry = envelope.clone();
            if let Err(e) = agent.enqueue_outgoing(envelope).await {
                tracing::warn!(envelope_id = %retry.id, error = %e, "Resend failed, releasing");
                context.store.store_outgoing(&retry, ANY_NODE).await?;
            }
        }
    }
    Ok(outcome)
}
