//! Store error types.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::fmt;

use thiserror::Error;

/// Errors that can occur during message store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backing store
    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Query execution failed
    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    /// An incoming envelope with this id is already stored
    #[error("duplicate envelope: {id}")]
    DuplicateEnvelope { id: String },

    /// Record not found
    #[error("record not found: {entity_type} with id '{id}'")]
    NotFound { entity_type: String, id: String },

    /// Record already exists
    #[error("record already exists: {entity_type} with id '{id}'")]
    AlreadyExists { entity_type: String, id: String },

    /// Serialization/deserialization error
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Transaction failed and was rolled back
    #[error("transaction failed: {reason}")]
    TransactionFailed { reason: String },

    /// Timeout waiting for operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Schema error
    #[error("schema error: {reason}")]
    SchemaError { reason: String },
}

impl StoreError {
    /// Create a connection failed error.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
        }
    }

    /// Create a query failed error.
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a duplicate envelope error.
    pub fn duplicate_envelope(id: impl ToString) -> Self {
        Self::DuplicateEnvelope { id: id.to_string() }
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create a transaction failed error.
    pub fn transaction_failed(reason: impl Into<String>) -> Self {
        Self::TransactionFailed {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a schema error.
    pub fn schema_error(reason: impl Into<String>) -> Self {
        Self::SchemaError {
            reason: reason.into(),
        }
    }

    /// Check if error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } | Self::TransactionFailed { .. }
        )
    }

    /// Check if the error signals an already-stored incoming envelope.
    #[must_use]
    pub const fn is_duplicate_envelope(&self) -> bool {
        matches!(self, Self::DuplicateEnvelope { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Helper to convert SurrealDB errors to `StoreError`.
pub fn from_surrealdb_error(err: impl fmt::Display) -> StoreError {
    let msg = err.to_string();

    // Categorize based on error message patterns
    if msg.contains("timeout") || msg.contains("Timeout") {
        StoreError::timeout(0)
    } else if msg.contains("connection") || msg.contains("Connection") || msg.contains("connect") {
        StoreError::connection_failed(msg)
    } else if msg.contains("already exists") || msg.contains("duplicate") {
        StoreError::already_exists("unknown", msg)
    } else if msg.contains("not found") || msg.contains("does not exist") {
        StoreError::not_found("unknown", msg)
    } else {
        StoreError::query_failed(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::connection_failed("reset").is_retryable());
        assert!(StoreError::timeout(500).is_retryable());
        assert!(StoreError::transaction_failed("conflict").is_retryable());
        assert!(!StoreError::query_failed("syntax").is_retryable());
        assert!(!StoreError::duplicate_envelope("abc").is_retryable());
    }

    #[test]
    fn test_duplicate_classification() {
        assert!(StoreError::duplicate_envelope("abc").is_duplicate_envelope());
        assert!(!StoreError::already_exists("lock", "1").is_duplicate_envelope());
    }

    #[test]
    fn test_from_surrealdb_error_categorizes_messages() {
        assert!(matches!(
            from_surrealdb_error("Database record `wharf_incoming:x` already exists"),
            StoreError::AlreadyExists { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("Connection refused"),
            StoreError::ConnectionFailed { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("Query timeout"),
            StoreError::Timeout { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("table does not exist"),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            from_surrealdb_error("Parse error"),
            StoreError::QueryFailed { .. }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::duplicate_envelope("0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(
            err.to_string(),
            "duplicate envelope: 0f8fad5b-d9cb-469f-a165-70867728950e"
        );
    }
}
