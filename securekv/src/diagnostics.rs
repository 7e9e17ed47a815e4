//! Whole-namespace integrity checks and security statistics.
//!
//! Diagnostics scan the byte store directly. They tolerate and count
//! individual failures instead of retrying, and only
//! [`clean_corrupted_data`](Diagnostics::clean_corrupted_data) mutates state.

use crate::config::SecureStoreConfig;
use crate::error::SecureStoreResult;
use crate::key_manager::KeyManager;
use securekv_crypto::{
    decrypt_value, CryptoError, DerivedKey, CHECKSUM_ALGORITHM, CIPHER_ALGORITHM, KDF_ALGORITHM,
};
use securekv_storage::KvStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Why a record failed verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Malformed token or checksum mismatch.
    Integrity,
    /// Checksum valid, payload could not be opened.
    Decryption,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    /// Caller-facing key (namespace prefix removed).
    pub key: String,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub total_keys: usize,
    pub valid_keys: usize,
    pub corrupted_keys: usize,
    pub errors: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted_keys == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SecurityStats {
    pub integrity: IntegrityReport,
    pub last_rotation_ms: i64,
    pub needs_rotation: bool,
    pub rotation_interval_ms: i64,
    pub rotation_in_progress: bool,
    /// A failed rotation left records under the previous key.
    pub migration_pending: bool,
    pub fallback_key_in_use: bool,
    pub namespace_prefix: String,
    pub cipher_algorithm: &'static str,
    pub checksum_algorithm: &'static str,
    pub kdf_algorithm: &'static str,
    pub kdf_iterations: u32,
}

/// Read-mostly view over the namespace.
#[derive(Clone)]
pub struct Diagnostics {
    store: Arc<dyn KvStore>,
    keys: Arc<KeyManager>,
    config: SecureStoreConfig,
}

impl Diagnostics {
    pub fn new(store: Arc<dyn KvStore>, keys: Arc<KeyManager>, config: SecureStoreConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// Attempts to open every namespaced record. Does not modify the store.
    pub async fn verify_integrity(&self) -> SecureStoreResult<IntegrityReport> {
        let (report, _) = self.scan().await?;
        Ok(report)
    }

    /// Deletes every namespaced record that cannot be opened.
    pub async fn clean_corrupted_data(&self) -> SecureStoreResult<usize> {
        let (_, corrupted) = self.scan().await?;
        if corrupted.is_empty() {
            return Ok(0);
        }
        self.store.multi_remove(&corrupted).await?;
        info!(removed = corrupted.len(), "removed corrupted records");
        Ok(corrupted.len())
    }

    pub async fn security_stats(&self) -> SecureStoreResult<SecurityStats> {
        let integrity = self.verify_integrity().await?;
        Ok(SecurityStats {
            integrity,
            last_rotation_ms: self.keys.last_rotation_ms().await,
            needs_rotation: self.keys.needs_rotation().await,
            rotation_interval_ms: self.keys.policy().interval_ms,
            rotation_in_progress: self.keys.is_rotating(),
            migration_pending: self.keys.migration_pending().await,
            fallback_key_in_use: self.keys.fallback_key_in_use(),
            namespace_prefix: self.config.namespace_prefix.clone(),
            cipher_algorithm: CIPHER_ALGORITHM,
            checksum_algorithm: CHECKSUM_ALGORITHM,
            kdf_algorithm: KDF_ALGORITHM,
            kdf_iterations: self.config.pbkdf2_iterations,
        })
    }

    /// Returns the report plus the storage keys of every failing record.
    async fn scan(&self) -> SecureStoreResult<(IntegrityReport, Vec<String>)> {
        let keys = self
            .store
            .list_keys_with_prefix(&self.config.namespace_prefix)
            .await?;
        let mut report = IntegrityReport::default();
        let mut corrupted = Vec::new();
        if keys.is_empty() {
            return Ok((report, corrupted));
        }

        let current = self.keys.current_key().await?;
        let fallbacks = self.keys.recovery_keys(&current).await;

        for (storage_key, token) in self.store.multi_get(&keys).await? {
            // Removed between listing and reading.
            let Some(token) = token else { continue };
            report.total_keys += 1;

            match open_with_any(&current, &fallbacks, &token) {
                Ok(()) => report.valid_keys += 1,
                Err(e) => {
                    let kind = if e.is_integrity() {
                        IssueKind::Integrity
                    } else {
                        IssueKind::Decryption
                    };
                    report.errors.push(IntegrityIssue {
                        key: self
                            .config
                            .logical_key(&storage_key)
                            .unwrap_or(storage_key.as_str())
                            .to_string(),
                        kind,
                        message: e.to_string(),
                    });
                    corrupted.push(storage_key);
                }
            }
        }
        report.corrupted_keys = corrupted.len();
        Ok((report, corrupted))
    }
}

fn open_with_any(
    current: &DerivedKey,
    fallbacks: &[DerivedKey],
    token: &str,
) -> Result<(), CryptoError> {
    match decrypt_value(current, token) {
        Ok(_) => Ok(()),
        Err(e) if e.is_decryption() => {
            if fallbacks.iter().any(|k| decrypt_value(k, token).is_ok()) {
                Ok(())
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}
