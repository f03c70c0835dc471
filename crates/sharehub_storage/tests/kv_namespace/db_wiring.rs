#![forbid(unsafe_code)]

use proptest::prelude::*;
use serde_json::json;
use sharehub_storage::{BoundedStore, MemoryBackend, StorageFault};

fn store_with_neighbours() -> (MemoryBackend, BoundedStore) {
    let backend = MemoryBackend::new();
    backend.raw_set("other_app_token", "keep-me");
    backend.raw_set("sharehubX", "no-underscore-not-ours");
    let store = BoundedStore::new(backend.clone());
    (backend, store)
}

#[test]
fn at_kv_db_01_user_roundtrip_then_remove() {
    let (_backend, store) = store_with_neighbours();
    let user = json!({"id": "u1", "name": "Ann", "email": "a@x.com", "provider": "email"});

    assert!(store.set_item("user", &user));
    assert_eq!(store.get_item("user", serde_json::Value::Null), user);

    assert!(store.remove_item("user"));
    assert_eq!(
        store.get_item::<Option<serde_json::Value>>("user", None),
        None
    );
}

#[test]
fn at_kv_db_02_remove_is_idempotent() {
    let (_backend, store) = store_with_neighbours();
    assert!(store.remove_item("never_written"));
    assert!(store.remove_item("never_written"));
}

#[test]
fn at_kv_db_03_clear_only_touches_namespace() {
    let (backend, store) = store_with_neighbours();
    assert!(store.set_item("user", &json!({"id": "u1"})));
    assert!(store.set_item("error_logs", &json!([])));
    assert!(store.set_item("cache_map_tiles", &json!({"z": 3})));

    assert!(store.clear());

    assert!(store.namespaced_keys().is_empty());
    assert_eq!(
        backend.raw_keys(),
        vec!["other_app_token".to_string(), "sharehubX".to_string()]
    );
    assert_eq!(backend.raw_get("other_app_token").as_deref(), Some("keep-me"));
}

#[test]
fn at_kv_db_04_write_failure_returns_false_never_panics() {
    let (backend, store) = store_with_neighbours();
    backend.set_fail_writes(true);
    assert!(!store.set_item("user", &json!({"id": "u1"})));
    assert!(matches!(
        store.take_last_fault(),
        Some(StorageFault::Unavailable(_))
    ));
    assert_eq!(store.get_item("user", json!(null)), json!(null));
}

#[test]
fn at_kv_db_05_quota_retry_failure_reports_false() {
    let backend = MemoryBackend::with_quota(48);
    let store = BoundedStore::new(backend.clone());
    assert!(store.set_item("user", &"u".repeat(20)));
    // Nothing non-essential to evict: the retry fails and the old value stays.
    assert!(!store.set_item("profile", &"p".repeat(40)));
    assert!(backend.raw_get("sharehub_user").is_some());
    assert!(backend.raw_get("sharehub_profile").is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_set_then_get_returns_equal_value(
        key in "[a-z_]{1,24}",
        value in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8),
    ) {
        let store = BoundedStore::new(MemoryBackend::new());
        prop_assert!(store.set_item(&key, &value));
        let got: std::collections::BTreeMap<String, i64> = store.get_item(&key, Default::default());
        prop_assert_eq!(got, value);
    }
}
