//! Error types for the crypto layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur while sealing, opening, or deriving keys.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The value could not be sealed (null input, serialization or cipher failure).
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The token is malformed or its checksum does not match.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The checksum matched but the payload could not be opened
    /// (wrong key, bad padding, or a payload that is not JSON).
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

impl CryptoError {
    /// True for failures that indicate a damaged token rather than a bad key.
    pub fn is_integrity(&self) -> bool {
        matches!(self, CryptoError::Integrity(_))
    }

    /// True for failures that a different key might resolve.
    pub fn is_decryption(&self) -> bool {
        matches!(self, CryptoError::Decryption(_))
    }
}
