use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Lock timeout: {resource} not acquired within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("Record not found: {collection} ({target})")]
    RecordNotFound { collection: String, target: String },

    #[error("Storage read failure on {collection}: {reason}")]
    StorageReadFailure { collection: String, reason: String },

    #[error("Storage write failure on {collection}: {reason}")]
    StorageWriteFailure { collection: String, reason: String },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Stable identifier for the failure mode, for callers that need to branch
    /// on the kind of error without parsing the message.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::LockTimeout { .. } => "LOCK_TIMEOUT",
            StorageError::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            StorageError::StorageReadFailure { .. } => "STORAGE_READ_FAILURE",
            StorageError::StorageWriteFailure { .. } => "STORAGE_WRITE_FAILURE",
            StorageError::Lock(_) => "LOCK_ERROR",
            StorageError::InvalidArgument(_) => "INVALID_ARGUMENT",
            StorageError::Serialization(_) => "SERIALIZATION_ERROR",
            StorageError::Unsupported(_) => "UNSUPPORTED",
            StorageError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a caller may retry the same operation after a backoff.
    ///
    /// The store never retries these itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::LockTimeout { .. } | StorageError::StorageWriteFailure { .. }
        )
    }

    /// Shorthand for [`StorageError::RecordNotFound`].
    pub fn not_found(collection: &str, target: impl Into<String>) -> Self {
        StorageError::RecordNotFound {
            collection: collection.to_string(),
            target: target.into(),
        }
    }
}
