use wharf_core::millis;
use wharf_store::{DurabilityOperations, IncomingCount, MessageInbox};

use super::{ActionOutcome, AgentContext};
use crate::error::DurabilityResult;
use crate::transport::{BufferingLimits, ListenerStatus, ListeningAgent};

/// How many envelopes to claim for a listener with `count` waiting.
///
/// Zero unless the listener is accepting; never more than the listener can
/// buffer, nor more than `batch_size`.
#[must_use]
pub fn determine_page_size(listener: &dyn ListeningAgent, count: usize, batch_size: usize) -> usize {
    page_size(
        listener.status(),
        listener.queue_count(),
        listener.buffering_limits(),
        count,
        batch_size,
    )
}

fn page_size(
    status: ListenerStatus,
    queue_count: usize,
    limits: BufferingLimits,
    count: usize,
    batch_size: usize,
) -> usize {
    if status != ListenerStatus::Accepting {
        return 0;
    }
    let capacity = limits.maximum.saturating_sub(queue_count);
    count.min(batch_size).min(capacity)
}

pub(super) async fn run(context: &AgentContext) -> DurabilityResult<ActionOutcome> {
    let received_before =
        context.clock.now() - millis(context.settings.incoming_recovery_age_ms);
    let counts = context
        .store
        .load_globally_owned_incoming_counts(received_before)
        .await?;

    let mut outcome = ActionOutcome::Done;
    for IncomingCount { destination, count } in counts {
        let Some(listener) = context.endpoints.find_listener(&destination) else {
            tracing::warn!(%destination, count, "No listener for orphaned incoming envelopes");
            continue;
        };

        let page = determine_page_size(listener.as_ref(), count, context.settings.recovery_batch_size);
        if page == 0 {
            tracing::debug!(%destination, status = ?listener.status(), "Listener cannot take recovered envelopes");
            continue;
        }

        let envelopes = context
            .store
            .load_page_of_globally_owned_incoming(&destination, page)
            .await?;
        let claimed = context
            .store
            .reassign_incoming(context.node_number, &envelopes)
            .await?;

        if !claimed.is_empty() {
            tracing::info!(%destination, claimed = claimed.len(), "Recovered incoming envelopes");
            if let Err(e) = listener.enqueue_directly(claimed.clone()).await {
                let released = context
                    .store
                    .release_incoming_envelopes(context.node_number, &claimed)
                    .await?;
                tracing::warn!(%destination, released, error = %e, "Listener refused recovered envelopes");
                continue;
            }
        }

        if page < count {
            outcome = ActionOutcome::Reschedule;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn status() -> impl Strategy<Value = ListenerStatus> {
        prop_oneof![
            Just(ListenerStatus::Accepting),
            Just(ListenerStatus::TooBusy),
            Just(ListenerStatus::Latched),
        ]
    }

    proptest! {
        #[test]
        fn page_never_exceeds_listener_capacity(
            status in status(),
            queue_count in 0usize..2_000,
            maximum in 0usize..2_000,
            count in 0usize..5_000,
            batch_size in 1usize..500,
        ) {
            let limits = BufferingLimits::new(maximum, maximum / 2);
            let page = page_size(status, queue_count, limits, count, batch_size);

            prop_assert!(page <= count);
            prop_assert!(page <= batch_size);
            prop_assert!(page <= maximum.saturating_sub(queue_count));
            if status != ListenerStatus::Accepting {
                prop_assert_eq!(page, 0);
            }
        }
    }

    #[test]
    fn test_accepting_listener_takes_a_full_batch() {
        let limits = BufferingLimits::new(1_000, 500);
        assert_eq!(page_size(ListenerStatus::Accepting, 10, limits, 250, 100), 100);
        assert_eq!(page_size(ListenerStatus::Accepting, 950, limits, 250, 100), 50);
        assert_eq!(page_size(ListenerStatus::Accepting, 10, limits, 7, 100), 7);
    }
}
