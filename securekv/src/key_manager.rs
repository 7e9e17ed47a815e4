//! Device key lifecycle: derivation, rotation scheduling, and record migration.
//!
//! The key manager is the only component that ever holds key material.
//! Callers receive a clone of the active key and use it for exactly one
//! encrypt or decrypt, so a concurrent rotation never changes a key that
//! is already in use.
//!
//! # Rotation
//!
//! 1. Derive a new key
//! 2. Persist the rotation timestamp (and the key, when a keychain is set)
//! 3. Swap the new key in, parking the old one as the retiring key
//! 4. Re-encrypt every namespaced record from the old key to the new one
//! 5. Drop the retiring key
//!
//! Failures in steps 1-2 leave the active key untouched and surface as
//! [`SecureStoreError::Rotation`]. During step 4, records that cannot be
//! opened under either key are deleted instead of migrated.
//!
//! If step 4 itself fails (the store cannot be listed, read or written), the
//! retiring key is kept. Reads keep opening old records with it, and the
//! migration is resumed by the next [`KeyManager::rotate_if_due`] or
//! [`KeyManager::rotate`] before any new key is derived.

use crate::clock::Clock;
use crate::config::SecureStoreConfig;
use crate::error::{SecureStoreError, SecureStoreResult};
use crate::keychain::Keychain;
use securekv_crypto::{
    decrypt_value, derive_device_key, encrypt_value, fallback_device_key, DerivedKey,
};
use securekv_storage::{KvStore, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Decides when the active key is due for replacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationPolicy {
    pub interval_ms: i64,
}

impl RotationPolicy {
    pub fn new(interval_ms: i64) -> Self {
        Self { interval_ms }
    }

    /// True once strictly more than `interval_ms` has elapsed since `last_rotation_ms`.
    pub fn needs_rotation(&self, last_rotation_ms: i64, now_ms: i64) -> bool {
        now_ms - last_rotation_ms > self.interval_ms
    }
}

/// Outcome of re-encrypting the namespace during a rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub purged: usize,
}

struct KeyState {
    current: Option<DerivedKey>,
    retiring: Option<DerivedKey>,
    last_rotation_ms: i64,
}

/// Owns the device key and its rotation schedule.
pub struct KeyManager {
    store: Arc<dyn KvStore>,
    config: SecureStoreConfig,
    clock: Arc<dyn Clock>,
    keychain: Option<Arc<dyn Keychain>>,
    policy: RotationPolicy,
    state: RwLock<KeyState>,
    rotation_lock: Mutex<()>,
    rotating: AtomicBool,
    fallback_in_use: AtomicBool,
}

/// Holds the rotation lock and keeps [`KeyManager::is_rotating`] raised.
struct RotationGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    rotating: &'a AtomicBool,
}

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.rotating.store(false, Ordering::SeqCst);
    }
}

impl KeyManager {
    /// Loads the rotation timestamp and the active key.
    ///
    /// A missing timestamp is initialized to now. The key comes from the
    /// keychain when one holds a key, and is derived otherwise.
    pub async fn initialize(
        store: Arc<dyn KvStore>,
        config: SecureStoreConfig,
        clock: Arc<dyn Clock>,
        keychain: Option<Arc<dyn Keychain>>,
    ) -> SecureStoreResult<Self> {
        let now = clock.now_ms();
        let metadata_key = config.rotation_metadata_key.clone();

        let last_rotation_ms = match store.get(&metadata_key).await? {
            Some(raw) => match raw.parse::<i64>() {
                Ok(ts) => ts,
                Err(e) => {
                    warn!("unreadable rotation timestamp {raw:?} ({e}), resetting to now");
                    store.set(&metadata_key, &now.to_string()).await?;
                    now
                }
            },
            None => {
                store.set(&metadata_key, &now.to_string()).await?;
                now
            }
        };

        let current = match &keychain {
            Some(kc) => kc.load_key().await?,
            None => None,
        };

        let manager = Self {
            policy: RotationPolicy::new(config.rotation_interval_ms),
            store,
            config,
            clock,
            keychain,
            state: RwLock::new(KeyState {
                current,
                retiring: None,
                last_rotation_ms,
            }),
            rotation_lock: Mutex::new(()),
            rotating: AtomicBool::new(false),
            fallback_in_use: AtomicBool::new(false),
        };
        manager.current_key().await?;
        Ok(manager)
    }

    /// Returns the active key, deriving it on first use.
    pub async fn current_key(&self) -> SecureStoreResult<DerivedKey> {
        if let Some(key) = self.state.read().await.current.clone() {
            return Ok(key);
        }

        let mut state = self.state.write().await;
        if let Some(key) = &state.current {
            return Ok(key.clone());
        }
        let (key, fallback) = self.derive_new_key();
        if let Some(kc) = &self.keychain {
            kc.store_key(&key).await?;
        }
        self.fallback_in_use.store(fallback, Ordering::SeqCst);
        state.current = Some(key.clone());
        Ok(key)
    }

    /// Keys other than `tried` that may open a record written around a rotation.
    pub async fn recovery_keys(&self, tried: &DerivedKey) -> Vec<DerivedKey> {
        let state = self.state.read().await;
        [state.current.as_ref(), state.retiring.as_ref()]
            .into_iter()
            .flatten()
            .filter(|k| *k != tried)
            .cloned()
            .collect()
    }

    pub async fn last_rotation_ms(&self) -> i64 {
        self.state.read().await.last_rotation_ms
    }

    pub async fn needs_rotation(&self) -> bool {
        let last = self.last_rotation_ms().await;
        self.policy.needs_rotation(last, self.clock.now_ms())
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// True while the active key is the fixed fallback key.
    pub fn fallback_key_in_use(&self) -> bool {
        self.fallback_in_use.load(Ordering::SeqCst)
    }

    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::SeqCst)
    }

    /// True while a retiring key is held for records not yet re-encrypted.
    pub async fn migration_pending(&self) -> bool {
        self.state.read().await.retiring.is_some()
    }

    /// Rotates if the policy says the key is due, otherwise finishes an
    /// interrupted migration if one is pending.
    pub async fn rotate_if_due(&self) -> SecureStoreResult<bool> {
        if self.needs_rotation().await {
            return self.rotate().await;
        }
        if !self.migration_pending().await {
            return Ok(false);
        }
        let Some(_rotation) = self.begin_rotation() else {
            return Ok(false);
        };
        self.resume_migration().await?;
        Ok(true)
    }

    /// Replaces the active key and migrates every namespaced record.
    ///
    /// Returns `Ok(false)` without doing anything if another rotation is
    /// already running.
    pub async fn rotate(&self) -> SecureStoreResult<bool> {
        let Some(_rotation) = self.begin_rotation() else {
            debug!("key rotation already in progress, skipping");
            return Ok(false);
        };

        // Only one retiring key is ever held.
        self.resume_migration().await?;

        let old_key = self.current_key().await?;
        let (new_key, fallback) = self.derive_new_key();
        let now = self.clock.now_ms();

        self.store
            .set(&self.config.rotation_metadata_key, &now.to_string())
            .await
            .map_err(|e| rotation_error("could not persist rotation timestamp", e))?;
        if let Some(kc) = &self.keychain {
            kc.store_key(&new_key)
                .await
                .map_err(|e| SecureStoreError::Rotation(format!("could not store new key: {e}")))?;
        }

        {
            let mut state = self.state.write().await;
            let previous = state.current.replace(new_key.clone());
            state.retiring = previous;
            state.last_rotation_ms = now;
        }
        self.fallback_in_use.store(fallback, Ordering::SeqCst);

        let summary = self.finish_migration(&old_key, &new_key).await?;
        info!(
            migrated = summary.migrated,
            purged = summary.purged,
            "key rotation complete"
        );
        Ok(true)
    }

    fn begin_rotation(&self) -> Option<RotationGuard<'_>> {
        let lock = self.rotation_lock.try_lock().ok()?;
        self.rotating.store(true, Ordering::SeqCst);
        Some(RotationGuard {
            _lock: lock,
            rotating: &self.rotating,
        })
    }

    /// Re-runs the migration left behind by a failed rotation.
    async fn resume_migration(&self) -> SecureStoreResult<()> {
        let (retiring, current) = {
            let state = self.state.read().await;
            match (&state.retiring, &state.current) {
                (Some(retiring), Some(current)) => (retiring.clone(), current.clone()),
                _ => return Ok(()),
            }
        };
        let summary = self.finish_migration(&retiring, &current).await?;
        info!(
            migrated = summary.migrated,
            purged = summary.purged,
            "resumed interrupted key migration"
        );
        Ok(())
    }

    /// Migrates, then drops the retiring key. On failure the retiring key
    /// stays so records sealed under it remain readable.
    async fn finish_migration(
        &self,
        old_key: &DerivedKey,
        new_key: &DerivedKey,
    ) -> SecureStoreResult<MigrationSummary> {
        match self.migrate_records(old_key, new_key).await {
            Ok(summary) => {
                self.state.write().await.retiring = None;
                Ok(summary)
            }
            Err(e) => {
                warn!("key migration interrupted, keeping previous key for reads: {e}");
                Err(e)
            }
        }
    }

    async fn migrate_records(
        &self,
        old_key: &DerivedKey,
        new_key: &DerivedKey,
    ) -> SecureStoreResult<MigrationSummary> {
        let keys = self
            .store
            .list_keys_with_prefix(&self.config.namespace_prefix)
            .await
            .map_err(|e| rotation_error("could not list records", e))?;
        if keys.is_empty() {
            return Ok(MigrationSummary::default());
        }

        let records = self
            .store
            .multi_get(&keys)
            .await
            .map_err(|e| rotation_error("could not read records", e))?;

        let mut rewritten = Vec::new();
        let mut purged = Vec::new();
        for (key, token) in records {
            let Some(token) = token else { continue };
            match decrypt_value(old_key, &token) {
                Ok(value) => match encrypt_value(new_key, &value) {
                    Ok(sealed) => rewritten.push((key, sealed)),
                    Err(e) => {
                        warn!(key = %key, "dropping record that could not be re-encrypted: {e}");
                        purged.push(key);
                    }
                },
                // Written under the new key after the swap.
                Err(_) if decrypt_value(new_key, &token).is_ok() => {}
                Err(e) => {
                    warn!(key = %key, "dropping record unreadable during key rotation: {e}");
                    purged.push(key);
                }
            }
        }

        if !rewritten.is_empty() {
            self.store
                .multi_set(&rewritten)
                .await
                .map_err(|e| rotation_error("could not write migrated records", e))?;
        }
        if !purged.is_empty() {
            self.store
                .multi_remove(&purged)
                .await
                .map_err(|e| rotation_error("could not remove unreadable records", e))?;
        }

        Ok(MigrationSummary {
            migrated: rewritten.len(),
            purged: purged.len(),
        })
    }

    /// Runs the device derivation pipeline, falling back to the fixed key on failure.
    fn derive_new_key(&self) -> (DerivedKey, bool) {
        match derive_device_key(
            &self.config.platform,
            self.clock.now_ms(),
            &self.config.kdf_params(),
        ) {
            Ok(key) => {
                debug!("derived new device key");
                (key, false)
            }
            Err(e) => {
                warn!(
                    platform = %self.config.platform,
                    "device key derivation failed, using fixed fallback key: {e}"
                );
                (fallback_device_key(), true)
            }
        }
    }
}

fn rotation_error(context: &str, err: StorageError) -> SecureStoreError {
    SecureStoreError::Rotation(format!("{context}: {err}"))
}
