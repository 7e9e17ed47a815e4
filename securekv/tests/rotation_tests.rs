mod support;

use pretty_assertions::assert_eq;
use securekv::{
    KvStore, ManualClock, MemoryKeychain, MemoryKvStore, SecureStore, SecureStoreConfig,
    SecureStoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use support::*;

#[tokio::test]
async fn forced_rotation_reencrypts_records() {
    init_tracing();
    let (store, raw, clock) = open_memory().await;
    store
        .set_multiple(&[("a", json!("alpha")), ("b", json!({"n": 2}))])
        .await
        .unwrap();
    let before_a = raw.get("secure_a").await.unwrap().unwrap();
    let before_b = raw.get("secure_b").await.unwrap().unwrap();

    clock.advance(5_000);
    assert!(store.force_key_rotation().await.unwrap());

    assert_ne!(raw.get("secure_a").await.unwrap().unwrap(), before_a);
    assert_ne!(raw.get("secure_b").await.unwrap().unwrap(), before_b);
    assert_eq!(
        store.get_item::<Value>("a").await.unwrap(),
        Some(json!("alpha"))
    );
    assert_eq!(
        store.get_item::<Value>("b").await.unwrap(),
        Some(json!({"n": 2}))
    );
    assert_eq!(store.key_manager().last_rotation_ms().await, START_MS + 5_000);
    assert_eq!(
        raw.get(&store.config().rotation_metadata_key)
            .await
            .unwrap()
            .unwrap(),
        (START_MS + 5_000).to_string()
    );
}

#[tokio::test]
async fn records_from_before_rotation_fail_under_old_key() {
    let (store, raw, _) = open_memory().await;
    let old_key = store.key_manager().current_key().await.unwrap();
    store.set_item("token", "abc").await.unwrap();

    store.force_key_rotation().await.unwrap();

    let sealed = raw.get("secure_token").await.unwrap().unwrap();
    let err = securekv_crypto::decrypt_value(&old_key, &sealed).unwrap_err();
    assert!(err.is_decryption());
}

#[tokio::test]
async fn rotation_runs_once_interval_has_elapsed() {
    let (store, raw, clock) = open_memory().await;
    store.set_item("token", "abc").await.unwrap();
    let before = raw.get("secure_token").await.unwrap().unwrap();

    clock.advance(DAY_MS);
    assert!(!store.key_manager().needs_rotation().await);
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
    assert_eq!(raw.get("secure_token").await.unwrap().unwrap(), before);

    clock.advance(1);
    assert!(store.key_manager().needs_rotation().await);
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
    assert_ne!(raw.get("secure_token").await.unwrap().unwrap(), before);
    assert_eq!(store.key_manager().last_rotation_ms().await, START_MS + DAY_MS + 1);
    assert!(!store.key_manager().needs_rotation().await);
}

#[tokio::test]
async fn concurrent_rotation_is_skipped() {
    let backend = ScriptedStore::new();
    let store = Arc::new(
        SecureStore::open_with(
            Arc::new(backend.clone()),
            fast_config(),
            Arc::new(ManualClock::new(START_MS)),
            None,
        )
        .await
        .unwrap(),
    );
    store.set_item("token", "abc").await.unwrap();

    backend.hold_next_listing();
    let rotating = {
        let store = store.clone();
        tokio::spawn(async move { store.force_key_rotation().await })
    };
    backend.listing_entered().await;

    assert!(store.key_manager().is_rotating());
    assert!(store.security_stats().await.unwrap().rotation_in_progress);
    assert!(!store.force_key_rotation().await.unwrap());

    backend.release_listing();
    assert!(rotating.await.unwrap().unwrap());
    assert!(!store.key_manager().is_rotating());
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn reads_during_migration_use_retiring_key() {
    let backend = ScriptedStore::new();
    let store = Arc::new(
        SecureStore::open_with(
            Arc::new(backend.clone()),
            fast_config(),
            Arc::new(ManualClock::new(START_MS)),
            None,
        )
        .await
        .unwrap(),
    );
    store.set_item("token", "abc").await.unwrap();

    // Hold the rotation after the key swap but before records are rewritten.
    backend.hold_next_listing();
    let rotating = {
        let store = store.clone();
        tokio::spawn(async move { store.force_key_rotation().await })
    };
    backend.listing_entered().await;

    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
    store.set_item("fresh", "new").await.unwrap();

    backend.release_listing();
    assert!(rotating.await.unwrap().unwrap());
    let values = store.get_multiple(&["token", "fresh"]).await.unwrap();
    assert_eq!(values["token"], Some(json!("abc")));
    assert_eq!(values["fresh"], Some(json!("new")));
}

#[tokio::test]
async fn failed_timestamp_write_leaves_key_untouched() {
    let backend = ScriptedStore::new();
    let config = fast_config();
    let store = SecureStore::open_with(
        Arc::new(backend.clone()),
        config.clone(),
        Arc::new(ManualClock::new(START_MS)),
        None,
    )
    .await
    .unwrap();
    store.set_item("token", "abc").await.unwrap();
    let before = backend.raw().get("secure_token").await.unwrap().unwrap();
    let key_before = store.key_manager().current_key().await.unwrap();

    backend.fail_writes_to(Some(&config.rotation_metadata_key));
    let err = store.force_key_rotation().await.unwrap_err();
    assert!(matches!(err, SecureStoreError::Rotation(_)));

    assert_eq!(store.key_manager().current_key().await.unwrap(), key_before);
    assert_eq!(store.key_manager().last_rotation_ms().await, START_MS);
    assert_eq!(
        backend.raw().get("secure_token").await.unwrap().unwrap(),
        before
    );
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
}

async fn open_scripted() -> (SecureStore, ScriptedStore) {
    let backend = ScriptedStore::new();
    let store = SecureStore::open_with(
        Arc::new(backend.clone()),
        fast_config(),
        Arc::new(ManualClock::new(START_MS)),
        None,
    )
    .await
    .unwrap();
    (store, backend)
}

#[tokio::test]
async fn interrupted_migration_keeps_records_readable() {
    init_tracing();
    let (store, backend) = open_scripted().await;
    store.set_item("token", "abc").await.unwrap();
    let before = backend.raw().get("secure_token").await.unwrap().unwrap();

    // The first failure interrupts the forced rotation, the second the
    // resume attempted by the next read.
    backend.fail_next_listings(2);
    let err = store.force_key_rotation().await.unwrap_err();
    assert!(matches!(err, SecureStoreError::Rotation(_)));
    assert!(store.key_manager().migration_pending().await);

    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
    assert_eq!(
        backend.raw().get("secure_token").await.unwrap().as_deref(),
        Some(before.as_str())
    );

    let stats = store.security_stats().await.unwrap();
    assert!(stats.migration_pending);
    assert_eq!(stats.integrity.valid_keys, 1);

    // Storage is healthy again; the next operation finishes the migration.
    assert!(store.has_item("token").await.unwrap());
    assert!(!store.key_manager().migration_pending().await);
    assert_ne!(
        backend.raw().get("secure_token").await.unwrap().unwrap(),
        before
    );
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn failed_migration_write_is_resumed_by_next_rotation() {
    let (store, backend) = open_scripted().await;
    store
        .set_multiple(&[("a", json!(1)), ("b", json!(2))])
        .await
        .unwrap();
    let original_key = store.key_manager().current_key().await.unwrap();
    let before = backend.raw().get("secure_a").await.unwrap().unwrap();

    backend.fail_next_multi_sets(1);
    assert!(matches!(
        store.force_key_rotation().await,
        Err(SecureStoreError::Rotation(_))
    ));
    assert!(store.key_manager().migration_pending().await);
    assert_eq!(
        backend.raw().get("secure_a").await.unwrap().unwrap(),
        before
    );
    assert!(store.verify_integrity().await.unwrap().is_clean());

    assert!(store.force_key_rotation().await.unwrap());
    assert!(!store.key_manager().migration_pending().await);

    let values = store.get_multiple(&["a", "b"]).await.unwrap();
    assert_eq!(values["a"], Some(json!(1)));
    assert_eq!(values["b"], Some(json!(2)));
    let sealed = backend.raw().get("secure_a").await.unwrap().unwrap();
    assert!(securekv_crypto::decrypt_value(&original_key, &sealed).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_do_not_block_rotation() {
    let (store, _, _) = open_memory().await;
    let store = Arc::new(store);
    store.set_item("token", "abc").await.unwrap();

    let reporter = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                store.security_stats().await.unwrap();
            }
        })
    };
    for _ in 0..10 {
        assert!(store.force_key_rotation().await.unwrap());
    }
    reporter.await.unwrap();

    assert!(!store.key_manager().is_rotating());
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn failed_scheduled_rotation_does_not_fail_operations() {
    let backend = ScriptedStore::new();
    let config = fast_config();
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = SecureStore::open_with(
        Arc::new(backend.clone()),
        config.clone(),
        clock.clone(),
        None,
    )
    .await
    .unwrap();
    store.set_item("token", "abc").await.unwrap();

    backend.fail_writes_to(Some(&config.rotation_metadata_key));
    clock.advance(DAY_MS + 1);

    assert!(store.set_item("other", &1).await.unwrap());
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
    assert!(store.key_manager().needs_rotation().await);

    backend.fail_writes_to(None);
    assert_eq!(store.get_item::<i64>("other").await.unwrap(), Some(1));
    assert!(!store.key_manager().needs_rotation().await);
}

#[tokio::test]
async fn rotation_drops_unreadable_records() {
    let (store, raw, _) = open_memory().await;
    store.set_item("good", "kept").await.unwrap();
    raw.set("secure_garbled", "not-a-token").await.unwrap();
    let foreign = securekv_crypto::generate_random_key();
    raw.set(
        "secure_foreign",
        &securekv_crypto::encrypt_value(&foreign, &json!(1)).unwrap(),
    )
    .await
    .unwrap();
    raw.set("unrelated", "left alone").await.unwrap();

    assert!(store.force_key_rotation().await.unwrap());

    assert_eq!(raw.get("secure_garbled").await.unwrap(), None);
    assert_eq!(raw.get("secure_foreign").await.unwrap(), None);
    assert_eq!(
        raw.get("unrelated").await.unwrap().as_deref(),
        Some("left alone")
    );
    assert_eq!(
        store.get_item::<String>("good").await.unwrap().as_deref(),
        Some("kept")
    );
}

#[tokio::test]
async fn rotation_timestamp_survives_reopen() {
    let raw = MemoryKvStore::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    SecureStore::open_with(Arc::new(raw.clone()), fast_config(), clock.clone(), None)
        .await
        .unwrap();

    clock.advance(60_000);
    let reopened = SecureStore::open_with(Arc::new(raw.clone()), fast_config(), clock, None)
        .await
        .unwrap();
    assert_eq!(reopened.key_manager().last_rotation_ms().await, START_MS);
}

#[tokio::test]
async fn unreadable_timestamp_resets_to_now() {
    let raw = MemoryKvStore::new();
    let config = fast_config();
    raw.set(&config.rotation_metadata_key, "yesterday")
        .await
        .unwrap();

    let store = SecureStore::open_with(
        Arc::new(raw.clone()),
        config.clone(),
        Arc::new(ManualClock::new(START_MS)),
        None,
    )
    .await
    .unwrap();
    assert_eq!(store.key_manager().last_rotation_ms().await, START_MS);
    assert_eq!(
        raw.get(&config.rotation_metadata_key).await.unwrap(),
        Some(START_MS.to_string())
    );
}

#[tokio::test]
async fn reopen_without_keychain_loses_old_records() {
    let raw = MemoryKvStore::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let first = SecureStore::open_with(Arc::new(raw.clone()), fast_config(), clock.clone(), None)
        .await
        .unwrap();
    first.set_item("token", "abc").await.unwrap();

    let second = SecureStore::open_with(Arc::new(raw.clone()), fast_config(), clock, None)
        .await
        .unwrap();
    assert_eq!(second.get_item::<String>("token").await.unwrap(), None);
    assert_eq!(raw.get("secure_token").await.unwrap(), None);
}

#[tokio::test]
async fn keychain_carries_key_across_reopen_and_rotation() {
    let raw = MemoryKvStore::new();
    let keychain = Arc::new(MemoryKeychain::new());
    let clock = Arc::new(ManualClock::new(START_MS));
    let first = SecureStore::open_with(
        Arc::new(raw.clone()),
        fast_config(),
        clock.clone(),
        Some(keychain.clone()),
    )
    .await
    .unwrap();
    assert!(!keychain.is_empty().await);
    first.set_item("token", "abc").await.unwrap();
    first.force_key_rotation().await.unwrap();
    drop(first);

    let second = SecureStore::open_with(
        Arc::new(raw.clone()),
        fast_config(),
        clock,
        Some(keychain),
    )
    .await
    .unwrap();
    assert_eq!(
        second.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn fallback_key_engages_when_derivation_fails() {
    init_tracing();
    let raw = MemoryKvStore::new();
    let config = SecureStoreConfig {
        pbkdf2_iterations: 1,
        ..fast_config()
    };
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = SecureStore::open_with(Arc::new(raw.clone()), config.clone(), clock.clone(), None)
        .await
        .unwrap();

    assert!(store.fallback_key_in_use());
    assert!(store.security_stats().await.unwrap().fallback_key_in_use);
    store.set_item("token", "abc").await.unwrap();
    assert_eq!(
        store.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );

    // The fallback key is fixed, so a second instance reads the same records.
    let again = SecureStore::open_with(Arc::new(raw.clone()), config, clock, None)
        .await
        .unwrap();
    assert_eq!(
        again.get_item::<String>("token").await.unwrap().as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn derived_key_is_not_the_fallback() {
    let (store, _, _) = open_memory().await;
    assert!(!store.fallback_key_in_use());
    let current = store.key_manager().current_key().await.unwrap();
    let fallback = securekv_crypto::fallback_device_key();
    assert_ne!(current, fallback);
}
