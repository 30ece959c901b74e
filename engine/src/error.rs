//! Error types for the FarmSync engine.

use crate::{EntityKind, LocalId, QueueStatus, SchemaVersion};
use thiserror::Error;

/// All possible errors from the FarmSync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("unknown {what}: {value}")]
    UnknownVariant { what: &'static str, value: String },

    #[error("no organization context for {0}")]
    NoOrganizationContext(EntityKind),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Record errors
    #[error("record not found: {0}")]
    RecordNotFound(LocalId),

    // Queue errors
    #[error("invalid queue transition: {from} -> {to}")]
    InvalidTransition { from: QueueStatus, to: QueueStatus },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected at most {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

impl Error {
    /// Whether the error is a caller-side precondition failure that must
    /// never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownEntityKind(_)
                | Error::UnknownVariant { .. }
                | Error::NoOrganizationContext(_)
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
