//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The SQL engine rejected an operation.
    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    /// A statement was used after it was closed.
    #[error("statement is closed: {sql}")]
    StatementClosed {
        /// The SQL text of the closed statement.
        sql: String,
    },

    /// A binding index was out of range (indexes are 1-based).
    #[error("invalid binding index {index}")]
    InvalidBinding {
        /// The rejected index.
        index: usize,
    },

    /// Transaction begin/end calls were unbalanced.
    #[error("no transaction in progress")]
    NoTransaction,

    /// The database connection is closed.
    #[error("database is closed")]
    Closed,

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
