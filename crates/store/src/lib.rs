//! # Wharf store
//!
//! The envelope model and the durable message store contract:
//!
//! - [`Envelope`] and its status lifecycle
//! - [`MessageStore`], the union of inbox, outbox, dead-letter, node and
//!   admin facets plus the claims the durability agent relies on
//! - [`EnvelopeTransaction`] for atomic envelope writes and the eager
//!   idempotency check
//! - [`AdvisoryLock`], lease-based named locks shared by a cluster
//!
//! Two backends ship with the crate: [`InMemoryMessageStore`] for tests and
//! single-process use, and [`SurrealMessageStore`] for shared storage.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod envelope;
pub mod error;
pub mod lock;
pub mod memory;
pub mod store;
pub mod surreal;
pub mod transaction;
pub mod types;

pub use envelope::{ANY_NODE, Envelope, EnvelopeStatus};
pub use error::{StoreError, StoreResult};
pub use lock::{
    AdvisoryLock, DEFAULT_LOCK_LEASE, INCOMING_MESSAGE_LOCK_ID, InMemoryAdvisoryLock,
    LEADERSHIP_LOCK_ID, LockLease, LockTable, OUTGOING_MESSAGE_LOCK_ID, REASSIGNMENT_LOCK_ID,
    SCHEDULED_JOB_LOCK_ID,
};
pub use memory::{InMemoryEnvelopeTransaction, InMemoryMessageStore};
pub use store::{
    DeadLetters, DurabilityOperations, MessageInbox, MessageOutbox, MessageStore,
    MessageStoreAdmin, NodePersistence,
};
pub use surreal::{
    Credentials, Statement, SurrealAdvisoryLock, SurrealConfig, SurrealEnvelopeTransaction,
    SurrealMessageStore,
};
pub use transaction::EnvelopeTransaction;
pub use types::{
    DeadLetterEnvelope, DeadLetterPage, DeadLetterQuery, ErrorReport, IncomingCount,
    InsertResult, NodeInfo, NodeRecord, NodeRecordType, PersistedCounts,
};
