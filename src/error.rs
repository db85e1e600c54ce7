//! Error types for the storage driver

use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while talking to the table or key service
#[derive(Error, Debug)]
pub enum BackendError {
    /// Item absent or logically expired
    #[error("Not found: {0}")]
    NotFound(String),

    /// Item already present where absence was required
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-lock precondition did not hold at the store
    #[error("Compare failed: {0}")]
    CompareFailed(String),

    /// Table exists with a key schema other than the one requested
    #[error("Schema conflict on table {table}: {detail}")]
    SchemaConflict { table: String, detail: String },

    /// Table exists with a key schema this driver does not recognize
    #[error("Unsupported key schema on table {table}: {detail}")]
    UnsupportedSchema { table: String, detail: String },

    /// Authentication tag mismatch or unrecognized ciphertext
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key service could not be reached or failed transiently
    #[error("Key service unavailable: {0}")]
    KeyServiceUnavailable(String),

    /// Key service refused the request
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Key alias or key id unknown to the key service
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Administrative target table missing
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Backing store request failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument to an operation
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Operation attempted after close()
    #[error("Backend is closed")]
    Closed,
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, BackendError::CompareFailed(_))
    }

    /// Errors a caller may retry as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::KeyServiceUnavailable(_) | BackendError::Storage(_)
        )
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(BackendError::NotFound("a/b".into()).is_not_found());
        assert!(BackendError::CompareFailed("a/b".into()).is_compare_failed());
        assert!(BackendError::KeyServiceUnavailable("timeout".into()).is_retryable());
        assert!(!BackendError::AccessDenied("nope".into()).is_retryable());
        assert!(!BackendError::DecryptionFailed("tag".into()).is_not_found());
    }

    #[test]
    fn test_display_carries_context() {
        let err = BackendError::UnsupportedSchema {
            table: "kv".into(),
            detail: "hash=Id".into(),
        };
        assert_eq!(err.to_string(), "Unsupported key schema on table kv: hash=Id");
    }
}
