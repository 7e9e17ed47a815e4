#![allow(dead_code)]

use async_trait::async_trait;
use securekv::{
    KvStore, ManualClock, MemoryKvStore, SecureStore, SecureStoreConfig, StorageError,
};
use securekv_storage::StorageResult;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const START_MS: i64 = 1_700_000_000_000;
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Default config without retry delays.
pub fn fast_config() -> SecureStoreConfig {
    SecureStoreConfig {
        retry_delay_ms: 0,
        ..SecureStoreConfig::default()
    }
}

/// Opens a store over a fresh in-memory backend, returning the raw backend
/// and the clock alongside it.
pub async fn open_memory() -> (SecureStore, MemoryKvStore, Arc<ManualClock>) {
    let raw = MemoryKvStore::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = SecureStore::open_with(Arc::new(raw.clone()), fast_config(), clock.clone(), None)
        .await
        .unwrap();
    (store, raw, clock)
}

/// Replaces one character of the ciphertext segment, leaving the checksum stale.
pub fn corrupt_ciphertext(token: &str) -> String {
    let mut parts: Vec<String> = token.split(':').map(str::to_string).collect();
    let first = parts[1].remove(0);
    let replacement = if first == 'A' { 'B' } else { 'A' };
    parts[1].insert(0, replacement);
    parts.join(":")
}

#[derive(Default)]
struct Knobs {
    failing_sets: AtomicU32,
    failing_gets: AtomicU32,
    failing_listings: AtomicU32,
    failing_multi_sets: AtomicU32,
    set_calls: AtomicU32,
    get_calls: AtomicU32,
    failing_key: Mutex<Option<String>>,
    gate_listing: AtomicBool,
    listing_entered: Notify,
    listing_release: Notify,
}

/// In-memory backend with injectable failures and a listing gate.
#[derive(Clone, Default)]
pub struct ScriptedStore {
    inner: MemoryKvStore,
    knobs: Arc<Knobs>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self) -> MemoryKvStore {
        self.inner.clone()
    }

    /// Fails the next `n` calls to `set`.
    pub fn fail_next_sets(&self, n: u32) {
        self.knobs.set_calls.store(0, Ordering::SeqCst);
        self.knobs.failing_sets.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` calls to `get`.
    pub fn fail_next_gets(&self, n: u32) {
        self.knobs.get_calls.store(0, Ordering::SeqCst);
        self.knobs.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` prefix listings.
    pub fn fail_next_listings(&self, n: u32) {
        self.knobs.failing_listings.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` batch writes.
    pub fn fail_next_multi_sets(&self, n: u32) {
        self.knobs.failing_multi_sets.store(n, Ordering::SeqCst);
    }

    /// Fails every write to `key` until cleared with `None`.
    pub fn fail_writes_to(&self, key: Option<&str>) {
        *self.knobs.failing_key.lock().unwrap() = key.map(str::to_string);
    }

    pub fn set_calls(&self) -> u32 {
        self.knobs.set_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.knobs.get_calls.load(Ordering::SeqCst)
    }

    /// Blocks the next prefix listing until [`release_listing`](Self::release_listing).
    pub fn hold_next_listing(&self) {
        self.knobs.gate_listing.store(true, Ordering::SeqCst);
    }

    pub async fn listing_entered(&self) {
        self.knobs.listing_entered.notified().await;
    }

    pub fn release_listing(&self) {
        self.knobs.listing_release.notify_one();
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(op: &str) -> StorageError {
        StorageError::Io(format!("injected {op} failure"))
    }
}

#[async_trait]
impl KvStore for ScriptedStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.knobs.get_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.knobs.failing_gets) {
            return Err(Self::injected("get"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.knobs.set_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.knobs.failing_sets) {
            return Err(Self::injected("set"));
        }
        if self.knobs.failing_key.lock().unwrap().as_deref() == Some(key) {
            return Err(Self::injected("metadata write"));
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.inner.remove(key).await
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.inner.list_keys().await
    }

    async fn multi_get(&self, keys: &[String]) -> StorageResult<Vec<(String, Option<String>)>> {
        self.inner.multi_get(keys).await
    }

    async fn multi_set(&self, entries: &[(String, String)]) -> StorageResult<()> {
        if Self::take_failure(&self.knobs.failing_multi_sets) {
            return Err(Self::injected("multi_set"));
        }
        self.inner.multi_set(entries).await
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        if self.knobs.gate_listing.swap(false, Ordering::SeqCst) {
            self.knobs.listing_entered.notify_one();
            self.knobs.listing_release.notified().await;
        }
        if Self::take_failure(&self.knobs.failing_listings) {
            return Err(Self::injected("listing"));
        }
        self.inner.list_keys_with_prefix(prefix).await
    }
}
