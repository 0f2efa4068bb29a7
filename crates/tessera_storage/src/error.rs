//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// File-level failures (a missing directory, a permission problem) surface
/// through the SQLite variant, since the database owns the file.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying SQLite database reported an error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The stored data did not have the expected shape.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
