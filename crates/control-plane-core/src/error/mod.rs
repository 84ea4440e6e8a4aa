//! Error taxonomy for the control plane.
//!
//! Every fallible operation in the workspace returns [`ControlPlaneError`].
//! The variants map one-to-one onto the failure kinds the RPC boundary
//! distinguishes: sequence conflicts are retried by the aggregate lock
//! manager, missing handlers surface immediately, and backend outages are
//! reported per store so reads can degrade while writes fail fast.

pub mod retry;

pub use retry::{retry_with_policy, RetryPolicy};

use thiserror::Error;

/// Result type used across the control plane.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Error kinds surfaced by control-plane operations.
#[derive(Error, Debug, Clone)]
pub enum ControlPlaneError {
    /// The expected sequence number did not match the aggregate's current
    /// sequence, or the storage layer rejected a duplicate
    /// `(aggregate_id, sequence_number)` pair.
    #[error("sequence conflict for aggregate {aggregate_id}: expected {expected}, current {current}")]
    SequenceConflict {
        aggregate_id: String,
        expected: i64,
        current: i64,
    },

    /// No live instance is registered for the requested message type.
    #[error("no healthy handler for {kind} type {message_type}")]
    NoHealthyHandler { kind: String, message_type: String },

    /// The registry key-value backend failed.
    #[error("registry unavailable: {message}")]
    RegistryUnavailable { message: String },

    /// The event log or snapshot store failed.
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// Malformed input rejected at the boundary.
    #[error("validation failed: {message}")]
    ValidationError { message: String },

    /// Payload or record serialization failed; the write is aborted.
    #[error("serialization failed: {message}")]
    SerializationError { message: String },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    ConfigurationError { message: String },

    /// The operation was cancelled before completion.
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },
}

impl ControlPlaneError {
    /// Whether the aggregate lock manager may retry the failed operation.
    ///
    /// Only sequence conflicts are transient under the optimistic-retry
    /// contract; routing misses and backend outages surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlPlaneError::SequenceConflict { .. })
    }

    /// Stable error code used in RPC responses and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            ControlPlaneError::SequenceConflict { .. } => "sequence_conflict",
            ControlPlaneError::NoHealthyHandler { .. } => "no_healthy_handler",
            ControlPlaneError::RegistryUnavailable { .. } => "registry_unavailable",
            ControlPlaneError::StorageUnavailable { .. } => "storage_unavailable",
            ControlPlaneError::ValidationError { .. } => "validation_error",
            ControlPlaneError::SerializationError { .. } => "serialization_error",
            ControlPlaneError::ConfigurationError { .. } => "configuration_error",
            ControlPlaneError::Cancelled { .. } => "cancelled",
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        ControlPlaneError::ValidationError {
            message: message.into(),
        }
    }

    /// Shorthand for a registry backend failure.
    pub fn registry(message: impl Into<String>) -> Self {
        ControlPlaneError::RegistryUnavailable {
            message: message.into(),
        }
    }

    /// Shorthand for an event/snapshot store failure.
    pub fn storage(message: impl Into<String>) -> Self {
        ControlPlaneError::StorageUnavailable {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(error: serde_json::Error) -> Self {
        ControlPlaneError::SerializationError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_sequence_conflicts_are_retryable() {
        let conflict = ControlPlaneError::SequenceConflict {
            aggregate_id: "u-1".to_string(),
            expected: 2,
            current: 3,
        };
        assert!(conflict.is_retryable());

        let no_handler = ControlPlaneError::NoHealthyHandler {
            kind: "command".to_string(),
            message_type: "CreateUserCommand".to_string(),
        };
        assert!(!no_handler.is_retryable());

        let registry = ControlPlaneError::registry("connection refused");
        assert!(!registry.is_retryable());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            ControlPlaneError::validation("bad input").code(),
            "validation_error"
        );
        assert_eq!(
            ControlPlaneError::storage("db down").code(),
            "storage_unavailable"
        );
    }

    #[test]
    fn test_serde_json_errors_map_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json")
            .expect_err("parse should fail");
        let mapped: ControlPlaneError = err.into();
        assert_eq!(mapped.code(), "serialization_error");
    }
}
