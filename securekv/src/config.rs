//! Secure store configuration.

use crate::error::{SecureStoreError, SecureStoreResult};
use securekv_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One day in milliseconds.
pub const DEFAULT_ROTATION_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// Configuration for a [`SecureStore`](crate::SecureStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureStoreConfig {
    /// Prefix prepended to every record key in the byte store.
    pub namespace_prefix: String,

    /// Byte-store key holding the last rotation timestamp. Must sit outside
    /// the namespace.
    pub rotation_metadata_key: String,

    /// Rotate once the current key is older than this.
    pub rotation_interval_ms: i64,

    /// Additional attempts after a retryable failure.
    pub max_retries: u32,

    /// Fixed pause between attempts.
    pub retry_delay_ms: u64,

    /// PBKDF2 iteration count for device key derivation.
    pub pbkdf2_iterations: u32,

    /// Platform identifier mixed into the device seed.
    pub platform: String,
}

impl Default for SecureStoreConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "secure_".to_string(),
            rotation_metadata_key: "securekv.last_rotation".to_string(),
            rotation_interval_ms: DEFAULT_ROTATION_INTERVAL_MS,
            max_retries: 3,
            retry_delay_ms: 1000,
            pbkdf2_iterations: securekv_crypto::MIN_PBKDF2_ITERATIONS,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl SecureStoreConfig {
    /// Checks the namespace layout.
    ///
    /// A low iteration count is deliberately not rejected here: it makes the
    /// derivation pipeline fail, which engages the fallback key.
    pub fn validate(&self) -> SecureStoreResult<()> {
        if self.namespace_prefix.is_empty() {
            return Err(SecureStoreError::Config(
                "namespace prefix must not be empty".into(),
            ));
        }
        if self.rotation_metadata_key.starts_with(&self.namespace_prefix) {
            return Err(SecureStoreError::Config(format!(
                "rotation metadata key {:?} must not start with namespace prefix {:?}",
                self.rotation_metadata_key, self.namespace_prefix
            )));
        }
        if self.rotation_interval_ms <= 0 {
            return Err(SecureStoreError::Config(
                "rotation interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::new(self.pbkdf2_iterations)
    }

    /// Byte-store key for a caller-supplied key.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace_prefix)
    }

    /// Caller-supplied key for a namespaced byte-store key.
    pub fn logical_key<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key.strip_prefix(self.namespace_prefix.as_str())
    }
}
