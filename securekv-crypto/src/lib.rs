//! Record encryption for SecureKV.
//!
//! Provides the two primitives the secure store is built on:
//! - A record codec sealing one JSON value into a self-checking string token
//!   (AES-256-CBC, per-record random IV, SHA-256 integrity checksum)
//! - PBKDF2-HMAC-SHA256 key derivation from a device seed, with a fixed
//!   fallback key for when the derivation pipeline is unavailable
//!
//! # Token format
//!
//! ```text
//! {iv hex}:{ciphertext base64}:{sha256("{iv}:{ciphertext}") hex}
//! ```
//!
//! Everything here is synchronous and side-effect free apart from drawing
//! randomness. Key lifecycle (rotation, persistence) lives in the `securekv`
//! crate.

pub mod codec;
mod error;
mod key;

pub use codec::{
    decrypt_value, encrypt_value, SealedToken, CHECKSUM_ALGORITHM, CIPHER_ALGORITHM, IV_SIZE,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    derive_device_key, derive_key, fallback_device_key, generate_random_key, DerivedKey,
    KdfParams, Salt, KEY_SIZE, MIN_PBKDF2_ITERATIONS, SALT_SIZE,
};

/// Name of the key-derivation function, for diagnostics output.
pub const KDF_ALGORITHM: &str = "PBKDF2-HMAC-SHA256";
