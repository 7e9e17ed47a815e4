//! Key material and PBKDF2 key derivation.

use crate::error::{CryptoError, CryptoResult};
use rand::{RngCore, TryRngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a PBKDF2 salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Lowest iteration count the derivation pipeline accepts.
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;

/// Seed of the fallback key.
const FALLBACK_SEED: &str = "securekv-fallback-seed";

/// Bytes of OS entropy mixed into a device seed.
const SEED_ENTROPY_SIZE: usize = 32;

/// A 256-bit symmetric key. Zeroized on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Builds a key from a slice, rejecting anything but exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Random PBKDF2 salt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a salt from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Generates a salt straight from the OS, surfacing entropy failures.
    pub fn try_random() -> CryptoResult<Self> {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyDerivation(format!("salt generation failed: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// PBKDF2 parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
}

impl KdfParams {
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    pub fn validate(&self) -> CryptoResult<()> {
        if self.iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CryptoError::KeyDerivation(format!(
                "iteration count {} below minimum {MIN_PBKDF2_ITERATIONS}",
                self.iterations
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: MIN_PBKDF2_ITERATIONS,
        }
    }
}

/// Stretches `secret` into a 256-bit key with PBKDF2-HMAC-SHA256.
pub fn derive_key(secret: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
    params.validate()?;
    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt.as_bytes(), params.iterations, &mut bytes);
    let key = DerivedKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

/// Derives a fresh device key.
///
/// The seed combines the platform identifier, a timestamp and OS entropy.
/// It is hashed with SHA-256 and the hex digest is stretched through PBKDF2
/// with a new random salt. Every call yields a different key.
pub fn derive_device_key(
    platform: &str,
    timestamp_ms: i64,
    params: &KdfParams,
) -> CryptoResult<DerivedKey> {
    params.validate()?;

    let mut entropy = [0u8; SEED_ENTROPY_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| CryptoError::KeyDerivation(format!("entropy source unavailable: {e}")))?;

    let mut seed = format!("{platform}-{timestamp_ms}-{}", hex::encode(entropy));
    entropy.zeroize();
    let mut seed_hash = hex::encode(Sha256::digest(seed.as_bytes()));
    seed.zeroize();

    let salt = Salt::try_random()?;
    let key = derive_key(&seed_hash, &salt, params);
    seed_hash.zeroize();
    key
}

/// Fixed, deterministic key used when [`derive_device_key`] fails.
///
/// Every installation shares it. Callers must make its use visible to
/// operators.
pub fn fallback_device_key() -> DerivedKey {
    let digest = Sha256::digest(FALLBACK_SEED.as_bytes());
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest);
    DerivedKey::from_bytes(bytes)
}

/// Generates a uniformly random key (tests, keychain bootstrap).
pub fn generate_random_key() -> DerivedKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    DerivedKey::from_bytes(bytes)
}
