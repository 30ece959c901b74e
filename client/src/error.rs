//! Unified error handling for the client.

use crate::remote::RemoteError;
use farmsync_engine::SchemaVersion;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] farmsync_engine::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local store is read-only")]
    ReadOnly,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Migration to version {version} failed: {reason}")]
    MigrationFailed {
        version: SchemaVersion,
        reason: String,
    },

    #[error("Migration to version {version} timed out")]
    MigrationTimeout { version: SchemaVersion },

    #[error("Seed data missing: {0}")]
    SeedDataMissing(String),

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(i64),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),
}

impl ClientError {
    /// Stable code for the UI.
    pub fn code(&self) -> &'static str {
        use farmsync_engine::Error as E;

        match self {
            ClientError::Database(_) => "STORAGE_ERROR",
            ClientError::Serialization(_) => "SERIALIZATION_ERROR",
            ClientError::Engine(e) => match e {
                E::NoOrganizationContext(_) => "NO_ORGANIZATION_CONTEXT",
                E::RecordNotFound(_) => "RECORD_NOT_FOUND",
                E::InvalidTransition { .. } => "INVALID_TRANSITION",
                E::InvalidSnapshot(_) | E::SchemaVersionMismatch { .. } => "INVALID_SNAPSHOT",
                _ => "VALIDATION_ERROR",
            },
            ClientError::Remote(RemoteError::Rejected { .. }) => "REJECTED_BY_SERVER",
            ClientError::Remote(_) => "TRANSIENT_SYNC_ERROR",
            ClientError::Io(_) => "IO_ERROR",
            ClientError::ReadOnly => "READ_ONLY",
            ClientError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            ClientError::MigrationFailed { .. } => "MIGRATION_FAILED",
            ClientError::MigrationTimeout { .. } => "MIGRATION_TIMEOUT",
            ClientError::SeedDataMissing(_) => "SEED_DATA_MISSING",
            ClientError::QueueEntryNotFound(_) => "QUEUE_ENTRY_NOT_FOUND",
            ClientError::BackupNotFound(_) => "BACKUP_NOT_FOUND",
        }
    }

    /// Caller-supplied data failed a precondition.
    pub fn is_validation(&self) -> bool {
        match self {
            ClientError::Engine(e) => e.is_validation(),
            ClientError::ReadOnly => true,
            _ => false,
        }
    }

    /// Errors that abort boot unless degraded mode is chosen.
    pub fn is_migration(&self) -> bool {
        matches!(
            self,
            ClientError::MigrationFailed { .. }
                | ClientError::MigrationTimeout { .. }
                | ClientError::SeedDataMissing(_)
        )
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_engine::EntityKind;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ClientError::ReadOnly.code(), "READ_ONLY");
        assert_eq!(
            ClientError::from(farmsync_engine::Error::NoOrganizationContext(
                EntityKind::Farm
            ))
            .code(),
            "NO_ORGANIZATION_CONTEXT"
        );
        assert_eq!(
            ClientError::from(farmsync_engine::Error::MissingRequiredField("name".into())).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            ClientError::MigrationFailed {
                version: 2,
                reason: "boom".into()
            }
            .code(),
            "MIGRATION_FAILED"
        );
    }

    #[test]
    fn classification() {
        assert!(ClientError::ReadOnly.is_validation());
        assert!(ClientError::MigrationTimeout { version: 3 }.is_migration());
        assert!(!ClientError::BackupNotFound("x".into()).is_migration());
    }
}
