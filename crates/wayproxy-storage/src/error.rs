//! Storage error types.

use thiserror::Error;

/// Errors that can occur in archive store operations.
///
/// A lookup that finds no capture is not an error (`Ok(None)`); everything
/// here except [`StorageError::CollectionNotFound`] and
/// [`StorageError::CollectionExists`] means the store itself is unusable for
/// the request.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Index database error from rusqlite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error reading or writing archive files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Collection does not exist.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Collection already exists.
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    /// Invalid collection name.
    #[error("Invalid collection: {0}")]
    InvalidCollection(#[from] wayproxy_core::ConfigError),

    /// An archive record could not be parsed.
    #[error("Malformed record in {file} at offset {offset}: {reason}")]
    MalformedRecord {
        /// Archive file name.
        file: String,
        /// Byte offset of the record.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// The store is unavailable (poisoned lock, failed background task).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),
}

impl StorageError {
    /// Whether the error means the requested collection is absent, as opposed
    /// to the store being broken.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CollectionNotFound(_))
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
