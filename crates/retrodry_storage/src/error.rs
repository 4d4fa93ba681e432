//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the SQL executor and the coordination store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The command names a table the database does not have.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// An update or delete matched no row.
    #[error("no row in {table} with {column} = {key}")]
    RowNotFound {
        /// Table name.
        table: String,
        /// Key column.
        column: String,
        /// Key value as text.
        key: String,
    },

    /// The engine rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// No session with this id exists.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The backing store failed.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}
