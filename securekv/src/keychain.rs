//! Platform key persistence seam.
//!
//! Without a keychain the device key lives only in memory, so records
//! written by an earlier process cannot be opened after a restart and are
//! purged on first read. Hosts that want records to outlive the process
//! plug in the platform keystore here.

use crate::error::SecureStoreResult;
use async_trait::async_trait;
use securekv_crypto::DerivedKey;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Stores the active device key outside the byte store.
#[async_trait]
pub trait Keychain: Send + Sync {
    async fn load_key(&self) -> SecureStoreResult<Option<DerivedKey>>;

    async fn store_key(&self, key: &DerivedKey) -> SecureStoreResult<()>;
}

/// Process-local keychain. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryKeychain {
    key: Arc<RwLock<Option<DerivedKey>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.key.read().await.is_none()
    }
}

#[async_trait]
impl Keychain for MemoryKeychain {
    async fn load_key(&self) -> SecureStoreResult<Option<DerivedKey>> {
        Ok(self.key.read().await.clone())
    }

    async fn store_key(&self, key: &DerivedKey) -> SecureStoreResult<()> {
        *self.key.write().await = Some(key.clone());
        Ok(())
    }
}
