//! The secure store facade.

use crate::clock::{Clock, SystemClock};
use crate::config::SecureStoreConfig;
use crate::diagnostics::{Diagnostics, IntegrityReport, SecurityStats};
use crate::error::{SecureStoreError, SecureStoreResult};
use crate::key_manager::KeyManager;
use crate::keychain::Keychain;
use crate::retry::RetryExecutor;
use securekv_crypto::{decrypt_value, encrypt_value};
use securekv_storage::KvStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a record was deleted on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgeReason {
    /// Malformed token or checksum mismatch.
    Integrity,
    /// Checksum valid but no known key could open it.
    Decryption,
}

/// Result of a read that distinguishes "never set" from "deleted as corrupt".
#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    Absent,
    Purged(PurgeReason),
    Present(Value),
}

impl ReadOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            ReadOutcome::Present(value) => Some(value),
            ReadOutcome::Absent | ReadOutcome::Purged(_) => None,
        }
    }
}

/// Encrypted key-value store over a [`KvStore`].
///
/// Every value is sealed with the key manager's active key and stored under
/// `{namespace_prefix}{key}`. Reads that hit a damaged record delete it and
/// report `None`. All public operations run through the retry executor and
/// rotate the key first when it is due.
///
/// Operations on the same key are not serialized: a write racing a read may
/// be observed either way.
pub struct SecureStore {
    store: Arc<dyn KvStore>,
    config: SecureStoreConfig,
    keys: Arc<KeyManager>,
    executor: RetryExecutor,
    diagnostics: Diagnostics,
}

impl SecureStore {
    /// Opens a store with the system clock and no keychain.
    pub async fn open(
        store: Arc<dyn KvStore>,
        config: SecureStoreConfig,
    ) -> SecureStoreResult<Self> {
        Self::open_with(store, config, Arc::new(SystemClock), None).await
    }

    /// Opens a store with an explicit clock and optional keychain.
    pub async fn open_with(
        store: Arc<dyn KvStore>,
        config: SecureStoreConfig,
        clock: Arc<dyn Clock>,
        keychain: Option<Arc<dyn Keychain>>,
    ) -> SecureStoreResult<Self> {
        config.validate()?;
        let keys = Arc::new(
            KeyManager::initialize(store.clone(), config.clone(), clock, keychain).await?,
        );
        let diagnostics = Diagnostics::new(store.clone(), keys.clone(), config.clone());
        Ok(Self {
            executor: RetryExecutor::from_config(&config),
            store,
            config,
            keys,
            diagnostics,
        })
    }

    pub fn config(&self) -> &SecureStoreConfig {
        &self.config
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// True while records are sealed with the fixed fallback key.
    pub fn fallback_key_in_use(&self) -> bool {
        self.keys.fallback_key_in_use()
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Encrypts and stores `value` under `key`.
    pub async fn set_item<T>(&self, key: &str, value: &T) -> SecureStoreResult<bool>
    where
        T: Serialize + ?Sized,
    {
        validate_key(key)?;
        let value = &to_record_value(value)?;
        let this = self;
        self.executor
            .execute(move || this.write_record(key, value))
            .await
    }

    /// Encrypts every entry, then writes them in one batch.
    ///
    /// Any invalid key or value fails the whole batch before anything is written.
    pub async fn set_multiple<K, V>(&self, entries: &[(K, V)]) -> SecureStoreResult<bool>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let key = key.as_ref();
            validate_key(key)?;
            records.push((key, to_record_value(value)?));
        }
        let records = &records;
        let this = self;
        self.executor
            .execute(move || this.write_records(records))
            .await
    }

    async fn write_record(&self, key: &str, value: &Value) -> SecureStoreResult<bool> {
        self.rotate_if_due().await;
        let token = encrypt_value(&self.keys.current_key().await?, value)?;
        self.store.set(&self.config.storage_key(key), &token).await?;
        Ok(true)
    }

    async fn write_records(&self, records: &[(&str, Value)]) -> SecureStoreResult<bool> {
        self.rotate_if_due().await;
        let current = self.keys.current_key().await?;
        let mut sealed = Vec::with_capacity(records.len());
        for (key, value) in records {
            sealed.push((self.config.storage_key(key), encrypt_value(&current, value)?));
        }
        self.store.multi_set(&sealed).await?;
        Ok(true)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Returns the value under `key`, or `None` if it was never set or was
    /// found damaged and deleted.
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> SecureStoreResult<Option<T>> {
        match self.get_item_detailed(key).await?.into_value() {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| SecureStoreError::TypeMismatch(e.to_string())),
            None => Ok(None),
        }
    }

    /// Like [`get_item`](Self::get_item) but reports whether a missing value
    /// was purged.
    pub async fn get_item_detailed(&self, key: &str) -> SecureStoreResult<ReadOutcome> {
        validate_key(key)?;
        let this = self;
        self.executor.execute(move || this.read_record(key)).await
    }

    /// Reads several keys. A damaged record yields `None` for its key only.
    pub async fn get_multiple<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> SecureStoreResult<HashMap<String, Option<Value>>> {
        let keys: Vec<&str> = keys.iter().map(|k| k.as_ref()).collect();
        for key in &keys {
            validate_key(key)?;
        }
        let keys = &keys;
        let this = self;
        self.executor.execute(move || this.read_records(keys)).await
    }

    pub async fn has_item(&self, key: &str) -> SecureStoreResult<bool> {
        validate_key(key)?;
        let this = self;
        self.executor
            .execute(move || async move {
                this.rotate_if_due().await;
                let token = this.store.get(&this.config.storage_key(key)).await?;
                Ok::<_, SecureStoreError>(token.is_some())
            })
            .await
    }

    async fn read_record(&self, key: &str) -> SecureStoreResult<ReadOutcome> {
        self.rotate_if_due().await;
        let storage_key = self.config.storage_key(key);
        match self.store.get(&storage_key).await? {
            Some(token) => self.open_or_purge(&storage_key, &token).await,
            None => Ok(ReadOutcome::Absent),
        }
    }

    async fn read_records(
        &self,
        keys: &[&str],
    ) -> SecureStoreResult<HashMap<String, Option<Value>>> {
        self.rotate_if_due().await;
        let storage_keys: Vec<String> = keys.iter().map(|k| self.config.storage_key(k)).collect();
        let records = self.store.multi_get(&storage_keys).await?;

        let mut out = HashMap::with_capacity(keys.len());
        for (key, (storage_key, token)) in keys.iter().zip(records) {
            let value = match token {
                Some(token) => self.open_or_purge(&storage_key, &token).await?.into_value(),
                None => None,
            };
            out.insert(key.to_string(), value);
        }
        Ok(out)
    }

    /// Opens a token, falling back to the retiring key after a decryption
    /// failure. Records no known key can open are deleted.
    async fn open_or_purge(&self, storage_key: &str, token: &str) -> SecureStoreResult<ReadOutcome> {
        let current = self.keys.current_key().await?;
        let err = match decrypt_value(&current, token) {
            Ok(value) => return Ok(ReadOutcome::Present(value)),
            Err(e) => e,
        };

        if err.is_decryption() {
            for candidate in self.keys.recovery_keys(&current).await {
                if let Ok(value) = decrypt_value(&candidate, token) {
                    debug!(key = storage_key, "opened record with a rotating key");
                    return Ok(ReadOutcome::Present(value));
                }
            }
        }

        let reason = if err.is_integrity() {
            PurgeReason::Integrity
        } else {
            PurgeReason::Decryption
        };
        warn!(key = storage_key, "purging unreadable record: {err}");
        self.store.remove(storage_key).await?;
        Ok(ReadOutcome::Purged(reason))
    }

    // ── Removal ──────────────────────────────────────────────────

    pub async fn remove_item(&self, key: &str) -> SecureStoreResult<bool> {
        validate_key(key)?;
        let this = self;
        self.executor
            .execute(move || async move {
                this.rotate_if_due().await;
                this.store.remove(&this.config.storage_key(key)).await?;
                Ok::<_, SecureStoreError>(true)
            })
            .await
    }

    /// Removes every record in the namespace. Other byte-store keys are untouched.
    pub async fn clear(&self) -> SecureStoreResult<bool> {
        let this = self;
        self.executor
            .execute(move || async move {
                this.rotate_if_due().await;
                let keys = this
                    .store
                    .list_keys_with_prefix(&this.config.namespace_prefix)
                    .await?;
                this.store.multi_remove(&keys).await?;
                Ok::<_, SecureStoreError>(true)
            })
            .await
    }

    // ── Keys & diagnostics ───────────────────────────────────────

    /// Rotates now, regardless of schedule. `Ok(false)` if a rotation is already running.
    pub async fn force_key_rotation(&self) -> SecureStoreResult<bool> {
        let keys: &KeyManager = &self.keys;
        self.executor.execute(move || keys.rotate()).await
    }

    pub async fn verify_integrity(&self) -> SecureStoreResult<IntegrityReport> {
        self.diagnostics.verify_integrity().await
    }

    pub async fn clean_corrupted_data(&self) -> SecureStoreResult<usize> {
        self.diagnostics.clean_corrupted_data().await
    }

    pub async fn security_stats(&self) -> SecureStoreResult<SecurityStats> {
        self.diagnostics.security_stats().await
    }

    /// Scheduled rotation. A failure here is logged and the operation proceeds
    /// with the current key.
    async fn rotate_if_due(&self) {
        if let Err(e) = self.keys.rotate_if_due().await {
            warn!("scheduled key rotation failed: {e}");
        }
    }
}

fn validate_key(key: &str) -> SecureStoreResult<()> {
    if key.is_empty() {
        return Err(SecureStoreError::InvalidKey(
            "key must be a non-empty string".into(),
        ));
    }
    Ok(())
}

fn to_record_value<T: Serialize + ?Sized>(value: &T) -> SecureStoreResult<Value> {
    let value = serde_json::to_value(value)?;
    if value.is_null() {
        return Err(SecureStoreError::InvalidValue(
            "value must not be null".into(),
        ));
    }
    Ok(value)
}
