//! Integration tests for the per-user secure cache
//!
//! Covers:
//! - Lossless round-trips for nested JSON values
//! - Ciphertext never leaking plaintext
//! - Isolation between users sharing one storage provider
//! - Scoped clearing, TTL expiry and sweeping

use bridge_traits::{Clock, InMemorySecureStore, InMemoryStorage, ManualClock, StorageProvider};
use chrono::Duration;
use core_cache::{CacheError, CacheMetadata, SecureCache, CACHE_KEY_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Fixture {
    storage: Arc<InMemoryStorage>,
    secure_store: Arc<InMemorySecureStore>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            storage: Arc::new(InMemoryStorage::new()),
            secure_store: Arc::new(InMemorySecureStore::new()),
            clock: Arc::new(ManualClock::starting_now()),
        }
    }

    async fn open(&self, user_id: &str) -> SecureCache {
        SecureCache::open(
            user_id,
            self.storage.clone(),
            self.secure_store.clone(),
            self.clock.clone(),
        )
        .await
        .unwrap()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CarePlan {
    id: String,
    resident: String,
    goals: Vec<String>,
    vitals: BTreeMap<String, f64>,
    notes: Option<String>,
}

fn sample_plan() -> CarePlan {
    CarePlan {
        id: "cp-001".to_string(),
        resident: "佐藤 一郎".to_string(),
        goals: vec!["歩行訓練".to_string(), "fall prevention".to_string()],
        vitals: BTreeMap::from([("temp".to_string(), 36.6), ("spo2".to_string(), 97.0)]),
        notes: None,
    }
}

#[core_async::test]
async fn test_round_trip_nested_structures() {
    let fixture = Fixture::new();
    let cache = fixture.open("nurse-1").await;

    let plan = sample_plan();
    cache.set("care_plans", &plan.id, &plan).await.unwrap();
    let restored: CarePlan = cache.get("care_plans", "cp-001").await.unwrap().unwrap();
    assert_eq!(restored, plan);

    let value = json!({
        "list": [1, 2, {"deep": [true, null, "テキスト"]}],
        "emoji": "🩺",
        "n": -12.5
    });
    cache.set("templates", "t-1", &value).await.unwrap();
    let restored: serde_json::Value = cache.get("templates", "t-1").await.unwrap().unwrap();
    assert_eq!(restored, value);
}

#[core_async::test]
async fn test_stored_value_never_contains_plaintext() {
    let fixture = Fixture::new();
    let cache = fixture.open("nurse-1").await;

    let plan = sample_plan();
    cache.set("care_plans", &plan.id, &plan).await.unwrap();

    let serialized = serde_json::to_string(&plan).unwrap();
    for (_, stored) in fixture.storage.snapshot().await {
        assert!(!stored.contains(&serialized));
        assert!(!stored.contains("佐藤"));
        assert!(!stored.contains("fall prevention"));
    }
}

#[core_async::test]
async fn test_users_are_isolated() {
    let fixture = Fixture::new();
    let alice = fixture.open("alice").await;
    let bob = fixture.open("bob").await;

    alice.set("patients", "p-1", &"alice-value").await.unwrap();
    bob.set("patients", "p-1", &"bob-value").await.unwrap();

    let seen_by_alice: String = alice.get("patients", "p-1").await.unwrap().unwrap();
    let seen_by_bob: String = bob.get("patients", "p-1").await.unwrap().unwrap();
    assert_eq!(seen_by_alice, "alice-value");
    assert_eq!(seen_by_bob, "bob-value");

    let carol = fixture.open("carol").await;
    assert_eq!(carol.get::<String>("patients", "p-1").await.unwrap(), None);
}

#[core_async::test]
async fn test_identical_plaintext_differs_between_users() {
    let fixture = Fixture::new();
    let alice = fixture.open("alice").await;
    let bob = fixture.open("bob").await;

    alice.set("patients", "p-1", &"same").await.unwrap();
    bob.set("patients", "p-1", &"same").await.unwrap();

    let alice_raw = fixture
        .storage
        .get(&alice.storage_key("patients", "p-1").unwrap())
        .await
        .unwrap()
        .unwrap();
    let bob_raw = fixture
        .storage
        .get(&bob.storage_key("patients", "p-1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(alice_raw, bob_raw);
}

#[core_async::test]
async fn test_other_users_ciphertext_is_unreadable() {
    let fixture = Fixture::new();
    let alice = fixture.open("alice").await;
    let bob = fixture.open("bob").await;

    alice.set("patients", "p-1", &"secret").await.unwrap();
    let alice_raw = fixture
        .storage
        .get(&alice.storage_key("patients", "p-1").unwrap())
        .await
        .unwrap()
        .unwrap();

    // Plant Alice's envelope under Bob's key
    fixture
        .storage
        .set(&bob.storage_key("patients", "p-1").unwrap(), &alice_raw)
        .await
        .unwrap();

    assert!(matches!(
        bob.get::<String>("patients", "p-1").await,
        Err(CacheError::Corrupted { .. })
    ));
}

#[core_async::test]
async fn test_key_material_survives_reopen() {
    let fixture = Fixture::new();
    {
        let cache = fixture.open("nurse-1").await;
        cache.set("patients", "p-1", &42).await.unwrap();
    }

    let reopened = fixture.open("nurse-1").await;
    assert_eq!(reopened.get::<i32>("patients", "p-1").await.unwrap(), Some(42));
}

#[core_async::test]
async fn test_clear_only_touches_own_entries() {
    let fixture = Fixture::new();
    let alice = fixture.open("alice").await;
    let bob = fixture.open("bob").await;

    for key in ["p-1", "p-2", "p-3"] {
        alice.set("patients", key, &key).await.unwrap();
    }
    alice.set("user_preferences", "lang", &"ja").await.unwrap();
    alice
        .set_metadata(&CacheMetadata {
            schema_version: 1,
            last_sync: fixture.clock.now(),
            record_counts: BTreeMap::new(),
        })
        .await
        .unwrap();
    bob.set("patients", "p-1", &"bob").await.unwrap();
    fixture.storage.set("unrelated", "value").await.unwrap();

    assert_eq!(alice.clear().await.unwrap(), 5);

    for key in ["p-1", "p-2", "p-3"] {
        assert_eq!(alice.get::<String>("patients", key).await.unwrap(), None);
    }
    assert_eq!(alice.get::<String>("user_preferences", "lang").await.unwrap(), None);
    assert_eq!(alice.get_metadata().await.unwrap(), None);

    assert_eq!(
        bob.get::<String>("patients", "p-1").await.unwrap().as_deref(),
        Some("bob")
    );
    assert_eq!(
        fixture.storage.get("unrelated").await.unwrap().as_deref(),
        Some("value")
    );

    let remaining: Vec<String> = fixture
        .storage
        .keys_with_prefix(CACHE_KEY_PREFIX)
        .await
        .unwrap();
    assert!(remaining.iter().all(|k| k.contains(bob.scope())));
}

#[core_async::test]
async fn test_ttl_expiry_and_sweep() {
    let fixture = Fixture::new();
    let cache = fixture.open("nurse-1").await;

    cache
        .set_with_ttl("schedules", "today", &"rounds", Duration::hours(1))
        .await
        .unwrap();
    cache
        .set_with_ttl("schedules", "week", &"plan", Duration::hours(48))
        .await
        .unwrap();
    cache.set("schedules", "forever", &"kept").await.unwrap();

    fixture.clock.advance(Duration::minutes(59));
    assert!(cache.get::<String>("schedules", "today").await.unwrap().is_some());

    fixture.clock.advance(Duration::minutes(2));
    assert_eq!(cache.get::<String>("schedules", "today").await.unwrap(), None);
    // Lazily removed on read
    assert_eq!(cache.keys("schedules").await.unwrap().len(), 2);

    fixture.clock.advance(Duration::hours(48));
    assert_eq!(cache.sweep_expired().await.unwrap(), 1);
    assert_eq!(cache.keys("schedules").await.unwrap(), vec!["forever".to_string()]);
}

#[core_async::test]
async fn test_rejects_invalid_input() {
    let fixture = Fixture::new();
    let cache = fixture.open("nurse-1").await;

    assert!(matches!(
        cache.set("", "k", &1).await,
        Err(CacheError::InvalidKey(_))
    ));
    assert!(matches!(
        cache.set("__meta__", "k", &1).await,
        Err(CacheError::InvalidKey(_))
    ));
    assert!(matches!(
        cache.set_with_ttl("patients", "k", &1, Duration::zero()).await,
        Err(CacheError::InvalidKey(_))
    ));

    let empty_user = SecureCache::open(
        "",
        fixture.storage.clone(),
        fixture.secure_store.clone(),
        fixture.clock.clone(),
    )
    .await;
    assert!(matches!(empty_user, Err(CacheError::InvalidKey(_))));
}
