//! Error types for Tabula core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tabula core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] tabula_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Two adapters claim the same storage-level name.
    #[error("duplicate entity name in schema: {name}")]
    DuplicateEntityName {
        /// The conflicting name.
        name: String,
    },

    /// Two adapters claim the same entity type.
    #[error("duplicate entity type in schema: {entity}")]
    DuplicateEntityType {
        /// Name of the conflicting entity type.
        entity: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// A handle lease outlived the handle it was taken from.
    #[error("stale handle: lease generation {held}, current generation {current}")]
    StaleHandle {
        /// Generation stamped on the lease.
        held: u64,
        /// Generation of the coordinator now.
        current: u64,
    },

    /// Backup was requested for a database without backup support.
    #[error("backups are not enabled for database {database}")]
    BackupNotEnabled {
        /// The database name.
        database: String,
    },

    /// The database failed its consistency check and could not be restored.
    #[error("integrity check failed for {path:?}")]
    IntegrityCheckFailed {
        /// The database file.
        path: PathBuf,
    },

    /// The handle factory could not produce a handle.
    #[error("handle creation failed: {message}")]
    HandleCreation {
        /// Description of the failure.
        message: String,
    },

    /// Transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The transaction queue no longer accepts work.
    #[error("transaction queue is stopped")]
    QueueStopped,
}

impl CoreError {
    /// Creates a handle creation error.
    pub fn handle_creation(message: impl Into<String>) -> Self {
        Self::HandleCreation {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for schema or usage contract violations.
    ///
    /// These abort the operation that found them and are never retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateEntityName { .. }
                | Self::DuplicateEntityType { .. }
                | Self::BackupNotEnabled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(CoreError::DuplicateEntityName { name: "users".into() }.is_fatal());
        assert!(CoreError::BackupNotEnabled { database: "app".into() }.is_fatal());
        assert!(!CoreError::DatabaseClosed.is_fatal());
        assert!(!CoreError::handle_creation("disk full").is_fatal());
    }

    #[test]
    fn display_messages() {
        let err = CoreError::StaleHandle { held: 1, current: 3 };
        assert_eq!(
            err.to_string(),
            "stale handle: lease generation 1, current generation 3"
        );
        assert_eq!(
            CoreError::migration_failed("boom").to_string(),
            "migration failed: boom"
        );
    }
}
