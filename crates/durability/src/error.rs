//! Durability error types.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;
use url::Url;
use wharf_store::StoreError;

/// Failure resolving a destination to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// No registered transport recognises the destination's scheme
    #[error("no transport recognises '{uri}'")]
    UnknownTransport { uri: Url },
}

impl EndpointError {
    /// Create an unknown transport error.
    pub fn unknown_transport(uri: &Url) -> Self {
        Self::UnknownTransport { uri: uri.clone() }
    }
}

/// A failure raised by a message handler.
///
/// `kind` is recorded as the dead letter's exception type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an error value, naming it by its Rust type.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }
}

/// Errors raised by the durability agent and its collaborators.
#[derive(Debug, Error)]
pub enum DurabilityError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// A queue or agent refused work because it is full or shutting down
    #[error("'{name}' is not accepting work")]
    NotAccepting { name: String },

    #[error("durability agent is already running")]
    AlreadyStarted,

    #[error("durability agent is not running")]
    NotStarted,

    /// Node registry used outside its lifecycle
    #[error("invalid node state: {reason}")]
    InvalidNodeState { reason: String },

    #[error(transparent)]
    Config(#[from] wharf_core::Error),
}

impl DurabilityError {
    pub fn not_accepting(name: impl Into<String>) -> Self {
        Self::NotAccepting { name: name.into() }
    }

    pub fn invalid_node_state(reason: impl Into<String>) -> Self {
        Self::InvalidNodeState {
            reason: reason.into(),
        }
    }

    /// Check if retrying on the next tick may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::NotAccepting { .. } => true,
            _ => false,
        }
    }
}

/// Result type for durability operations.
pub type DurabilityResult<T> = Result<T, DurabilityError>;
