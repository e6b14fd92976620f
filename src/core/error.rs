use super::domain::Domain;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The domain root is missing or unreadable; aborts that domain's build.
    #[error("Cannot scan the {domain} directory: {reason}")]
    Scan { domain: Domain, reason: String },

    /// A single file could not be turned into terms; the file is skipped.
    #[error("Cannot tokenize {path}: {reason}")]
    Tokenize { path: String, reason: String },

    /// One batch of embedding calls failed; zero vectors are substituted.
    #[error("Embedding batch {batch} failed: {reason}")]
    EmbeddingBatch { batch: usize, reason: String },

    #[error("Embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The persisted cache could not be read; it is treated as empty.
    #[error("Cache snapshot is corrupted: {0}")]
    CacheCorruption(String),

    #[error("The {0} index has not been built yet")]
    IndexNotReady(Domain),

    #[error("The {domain} index is unavailable: {reason}")]
    IndexFailed { domain: Domain, reason: String },

    #[error("Domain {0} is not configured")]
    DomainNotConfigured(Domain),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Model error: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Database(format!("Failed to open database: {}", e))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Database(format!("Failed to begin transaction: {}", e))
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Database(format!("Failed to open table: {}", e))
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Database(format!("Storage error: {}", e))
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Database(format!("Failed to commit transaction: {}", e))
    }
}

impl From<notify_debouncer_full::notify::Error> for Error {
    fn from(e: notify_debouncer_full::notify::Error) -> Self {
        Error::Watch(e.to_string())
    }
}
