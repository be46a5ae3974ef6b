//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Store not found.
    #[error("store not found: {store_id}")]
    StoreNotFound { store_id: String },

    /// Store already exists.
    #[error("store already exists: {store_id}")]
    StoreAlreadyExists { store_id: String },

    /// Authorization model not found.
    #[error("authorization model not found: {model_id}")]
    ModelNotFound { model_id: String },

    /// Tuple not found.
    #[error("tuple not found: {object_type}:{object_id}#{relation}@{user}")]
    TupleNotFound {
        object_type: String,
        object_id: String,
        relation: String,
        user: String,
    },

    /// A write batch conflicts with stored state: deleting a tuple that does
    /// not exist, or writing one that already does.
    #[error("invalid write input: {message}")]
    InvalidWriteInput { message: String },

    /// Invalid filter error.
    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Invalid continuation token.
    #[error("invalid continuation token: {token}")]
    InvalidContinuationToken { token: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
