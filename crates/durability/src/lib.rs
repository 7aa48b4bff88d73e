//! # Wharf durability
//!
//! Keeps messages alive across crashes and nodes:
//!
//! - [`DurabilityAgent`] recovers orphaned incoming and outgoing envelopes,
//!   runs scheduled envelopes when due, purges expired rows and releases the
//!   work of dormant nodes
//! - [`NodeRegistry`] and [`LeaderElection`] track cluster membership
//! - [`LocalDeliveryQueue`] runs [`MessageHandler`]s with the handled marker
//!   committed alongside their outgoing messages
//! - [`Publisher`] sends through the durable outbox
//!
//! [`DurableNode`] wires all of it for one process.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod actions;
pub mod agent;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod nodes;
pub mod outbox;
pub mod runtime;
pub mod transport;

pub use actions::{ActionOutcome, AgentAction, AgentContext, determine_page_size};
pub use agent::{DurabilityAgent, LONG_PERIOD_ACTIONS, SHORT_PERIOD_ACTIONS};
pub use delivery::{DeliveryOutcome, LocalDeliveryQueue, NO_HANDLER_EXCEPTION};
pub use error::{DurabilityError, DurabilityResult, EndpointError, HandlerError};
pub use handlers::{HandlerContext, HandlerRegistry, MessageHandler};
pub use nodes::{LeaderElection, NodeRegistry};
pub use outbox::Publisher;
pub use runtime::{DeliveryObserver, DurableNode, DurableNodeBuilder};
pub use transport::{
    BufferingLimits, EndpointCollection, EndpointRegistry, LOCAL_SCHEME, ListenerStatus,
    ListeningAgent, LocalQueue, LocalSendingAgent, LocalTransport, SendingAgent,
    TransportFactory,
};
