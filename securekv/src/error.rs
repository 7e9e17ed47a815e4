//! Secure store error types.

use securekv_crypto::CryptoError;
use securekv_storage::StorageError;
use thiserror::Error;

/// Result type for secure store operations.
pub type SecureStoreResult<T> = Result<T, SecureStoreError>;

/// Errors surfaced by the secure store.
#[derive(Debug, Error)]
pub enum SecureStoreError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("stored value does not match the requested type: {0}")]
    TypeMismatch(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("key rotation failed: {0}")]
    Rotation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SecureStoreError {
    /// Whether the retry executor may attempt the operation again.
    ///
    /// Only failures at the serialization and storage boundary qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SecureStoreError::Encryption(_)
                | SecureStoreError::Serialization(_)
                | SecureStoreError::Storage(_)
        )
    }

    /// Whether the error marks a damaged record rather than a failed call.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SecureStoreError::Integrity(_) | SecureStoreError::Decryption(_)
        )
    }
}

impl From<CryptoError> for SecureStoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Integrity(msg) => SecureStoreError::Integrity(msg),
            CryptoError::Decryption(msg) => SecureStoreError::Decryption(msg),
            CryptoError::Encryption(msg) => SecureStoreError::Encryption(msg),
            other => SecureStoreError::Encryption(other.to_string()),
        }
    }
}
