//! The byte-store interface consumed by the secure store.

use crate::error::StorageResult;
use async_trait::async_trait;

/// Persistent string key-value store.
///
/// Implementations must be safe to share across tasks. Values are opaque
/// strings; no encryption or validation happens at this layer.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Inserts or overwrites `key`.
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Deletes `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Lists every key in the store.
    async fn list_keys(&self) -> StorageResult<Vec<String>>;

    /// Reads several keys at once, preserving the order of `keys`.
    async fn multi_get(&self, keys: &[String]) -> StorageResult<Vec<(String, Option<String>)>>;

    /// Writes several entries at once.
    async fn multi_set(&self, entries: &[(String, String)]) -> StorageResult<()>;

    /// Deletes several keys at once.
    async fn multi_remove(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Lists the keys starting with `prefix`.
    async fn list_keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .list_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
