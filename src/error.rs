//! Error types for proxmesh.
//!
//! All errors are strongly typed using thiserror. Subscription rejections are
//! not errors in this sense: they are delivered to the application as
//! [`ErrorEvent`](crate::events::ErrorEvent)s and never cross the public API.

use thiserror::Error;

use crate::entity::EntityId;

/// Validation errors raised while constructing values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Entity id cannot be empty")]
    EmptyEntityId,

    #[error("Property bag must have exactly one top-level key 'properties' holding an object, got keys {keys:?}")]
    InvalidPropertyBag {
        keys: Vec<String>,
    },

    #[error("Invalid properties filter: {reason}")]
    InvalidFilter {
        reason: String,
    },

    #[error("Invalid point of interest list: {reason}")]
    InvalidPoi {
        reason: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },
}

/// Execution errors raised by the engine and its runtime.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Self entity id cannot change (current: {current}, requested: {requested})")]
    SelfIdentityChanged {
        current: EntityId,
        requested: EntityId,
    },

    #[error("Runtime component '{component}' has been stopped")]
    Stopped {
        component: String,
    },

    #[error("Channel '{path}' disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Lock '{name}' poisoned")]
    LockPoisoned {
        name: String,
    },
}

/// Errors reported by the publish/subscribe transport collaborator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Publish to '{channel}' failed: {message}")]
    PublishFailed {
        channel: String,
        message: String,
    },

    #[error("Subscription change on '{channel}' failed: {message}")]
    SubscriptionFailed {
        channel: String,
        message: String,
    },

    #[error("Failed to decode message: {message}")]
    DecodeFailed {
        message: String,
    },

    #[error("Failed to encode message: {message}")]
    EncodeFailed {
        message: String,
    },
}

/// Top-level error type for proxmesh.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProxError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ProxError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Transport(e) => matches!(
                e,
                TransportError::ConnectionFailed { .. }
                    | TransportError::PublishFailed { .. }
                    | TransportError::SubscriptionFailed { .. }
            ),
        }
    }
}

/// Result type alias for proxmesh operations.
pub type ProxResult<T> = Result<T, ProxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_property_bag() {
        let err = ValidationError::InvalidPropertyBag {
            keys: vec!["color".to_string()],
        };
        let msg = format!("{err}");
        assert!(msg.contains("properties"));
        assert!(msg.contains("color"));
    }

    #[test]
    fn test_execution_error_self_identity() {
        let err = ExecutionError::SelfIdentityChanged {
            current: EntityId::new("phone-a"),
            requested: EntityId::new("phone-b"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("phone-a"));
        assert!(msg.contains("phone-b"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        assert!(format!("{err}").contains("5000ms"));
    }

    #[test]
    fn test_prox_error_from_validation() {
        let err: ProxError = ValidationError::EmptyEntityId.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_prox_error_from_transport() {
        let err: ProxError = TransportError::ConnectionFailed {
            message: "refused".to_string(),
        }
        .into();
        assert!(err.is_transport());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_decode_failure_not_retryable() {
        let err: ProxError = TransportError::DecodeFailed {
            message: "eof".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_prox_error_internal() {
        let err = ProxError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
