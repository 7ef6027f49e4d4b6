//! Error types for the knowledge store

use thiserror::Error;

/// Result type alias for knowledge store operations
pub type Result<T> = std::result::Result<T, KnowledgeError>;

/// Coarse classification of every error a store can return.
///
/// Callers branch on the kind; the concrete variant carries the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Empty ID, malformed filter field or value, duplicate ID within one batch
    InvalidArgument,
    /// Add with an ID that already exists (live or deleted)
    AlreadyExists,
    /// Unknown ID, or ID in the wrong partition for the operation
    NotFound,
    /// Restore of a live record, delete of a deleted record
    InvalidStateTransition,
    /// File or database read/write/connectivity failure
    StorageIo,
    /// Persisted schema version is not the one this build requires
    SchemaIncompatible,
}

/// Main error type for the knowledge store
#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Store is not open: {0}")]
    NotOpen(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema incompatible: {0}")]
    SchemaIncompatible(String),

    #[error("Migration {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: Box<KnowledgeError>,
    },

    #[error("Batch record {index} ({id}) failed: {source}")]
    BatchRecord {
        index: usize,
        id: String,
        #[source]
        source: Box<KnowledgeError>,
    },
}

impl KnowledgeError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            KnowledgeError::InvalidArgument(_) | KnowledgeError::Config(_) => {
                ErrorKind::InvalidArgument
            }
            KnowledgeError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            KnowledgeError::NotFound(_) => ErrorKind::NotFound,
            KnowledgeError::InvalidStateTransition(_) => ErrorKind::InvalidStateTransition,
            KnowledgeError::SchemaIncompatible(_) => ErrorKind::SchemaIncompatible,
            KnowledgeError::NotOpen(_)
            | KnowledgeError::Database(_)
            | KnowledgeError::Serialization(_)
            | KnowledgeError::Io(_)
            | KnowledgeError::Storage(_) => ErrorKind::StorageIo,
            KnowledgeError::Migration { source, .. } => match source.kind() {
                ErrorKind::SchemaIncompatible => ErrorKind::SchemaIncompatible,
                _ => ErrorKind::StorageIo,
            },
            KnowledgeError::BatchRecord { source, .. } => source.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Wrap with the index and ID of the batch record that caused it
    pub(crate) fn in_batch(self, index: usize, id: &str) -> Self {
        KnowledgeError::BatchRecord {
            index,
            id: id.to_string(),
            source: Box::new(self),
        }
    }
}
