//! Publishing through the durable outbox.
//!
//! Envelopes are committed as outgoing rows owned by this node before any
//! transport sees them. After commit they are handed to their sending agent;
//! anything the agent cannot take is released to the any-node pool for
//! outgoing recovery.

use std::sync::Arc;

use wharf_core::{Clock, ResultExt};
use wharf_store::{ANY_NODE, Envelope, EnvelopeTransaction, MessageOutbox, MessageStore};

use crate::error::DurabilityResult;
use crate::transport::EndpointCollection;

/// Hands committed outgoing envelopes to their transports.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn MessageStore>,
    endpoints: Arc<dyn EndpointCollection>,
    node_number: i32,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        endpoints: Arc<dyn EndpointCollection>,
        node_number: i32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            endpoints,
            node_number,
            clock,
        }
    }

    #[must_use]
    pub const fn node_number(&self) -> i32 {
        self.node_number
    }

    /// Stage `envelopes` as outgoing rows owned by this node, stamped as
    /// sent at the node clock's current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction rejects a write.
    pub async fn enlist(
        &self,
        tx: &mut dyn EnvelopeTransaction,
        envelopes: Vec<Envelope>,
    ) -> DurabilityResult<()> {
        let now = self.clock.now();
        for mut envelope in envelopes {
            envelope.owner_id = self.node_number;
            envelope.sent_at = now;
            tx.persist_outgoing(&envelope).await?;
        }
        Ok(())
    }

    /// Commit `envelopes` in their own transaction and send them.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; nothing is sent in that case.
    pub async fn publish(&self, envelopes: Vec<Envelope>) -> DurabilityResult<()> {
        let mut tx = self.store.begin_transaction().await?;
        self.enlist(tx.as_mut(), envelopes).await?;
        let committed = tx.commit().await?;
        self.dispatch(committed).await;
        Ok(())
    }

    /// Send committed envelopes, releasing any that cannot be sent now.
    pub async fn dispatch(&self, committed: Vec<Envelope>) {
        for envelope in committed {
            let agent = match self.endpoints.get_or_build_sending_agent(&envelope.destination) {
                Ok(agent) if !agent.latched() => agent,
                Ok(_) => {
                    self.release(envelope, "sending agent is latched").await;
                    continue;
                }
                Err(e) => {
                    self.release(envelope, &e.to_string()).await;
                    continue;
                }
            };

            let retry = envelope.clone();
            if let Err(e) = agent.enqueue_outgoing(envelope).await {
                self.release(retry, &e.to_string()).await;
            }
        }
    }

    async fn release(&self, envelope: Envelope, reason: &str) {
        tracing::warn!(
            envelope_id = %envelope.id,
            destination = %envelope.destination,
            reason,
            "Outgoing envelope left for recovery"
        );
        let _ = self
            .store
            .store_outgoing(&envelope, ANY_NODE)
            .await
            .into_option_logged("release outgoing envelope");
    }
}
