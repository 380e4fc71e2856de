//! End-to-end consistency scenarios against the in-process store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cachekeeper::cache::{CacheConfig, CacheEngine, CacheError, CachedQuery};
use cachekeeper::store::{KeyTtl, KeyValueStore, MemoryStore};

fn engine() -> (Arc<dyn KeyValueStore>, CacheEngine) {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let engine = CacheEngine::new(Arc::clone(&store), CacheConfig::default());
    (store, engine)
}

#[tokio::test(start_paused = true)]
async fn cached_query_is_reused_until_its_ttl_elapses() {
    let (_, engine) = engine();
    let calls = AtomicUsize::new(0);
    let query = CachedQuery::new("user").ttl(Duration::from_secs(10));

    for _ in 0..3 {
        let user: Result<String, ()> = engine
            .records()
            .cached(&query, &[&42], || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("ada".to_string())
            })
            .await;
        assert_eq!(user.as_deref(), Ok("ada"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(11)).await;

    let user: Result<String, ()> = engine
        .records()
        .cached(&query, &[&42], || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("ada".to_string())
        })
        .await;
    assert_eq!(user.as_deref(), Ok("ada"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn compute_errors_are_not_cached() {
    let (store, engine) = engine();
    let query = CachedQuery::new("user");

    let failed: Result<u32, String> = engine
        .records()
        .cached(&query, &[&1], || async { Err("db down".to_string()) })
        .await;
    assert_eq!(failed, Err("db down".to_string()));
    assert!(store.get("data:user:1").await.unwrap().is_none());
}

#[tokio::test]
async fn invalidation_is_idempotent() {
    let (_, engine) = engine();
    let query = CachedQuery::new("user");
    let _: Result<u32, ()> = engine
        .records()
        .cached(&query, &[&1], || async { Ok(1) })
        .await;

    assert_eq!(engine.records().invalidate("user", &[&1]).await, 1);
    assert_eq!(engine.records().invalidate("user", &[&1]).await, 0);
}

#[tokio::test]
async fn invalidating_a_record_cascades_to_its_dependents() {
    let (store, engine) = engine();
    let records = engine.records();

    let _: Result<String, ()> = records
        .cached(&CachedQuery::new("user"), &[&1], || async {
            Ok("ada".to_string())
        })
        .await;
    let posts = CachedQuery::new("posts_by_user").depends_on("user", &[&1]);
    let _: Result<Vec<u32>, ()> = records
        .cached(&posts, &[&1], || async { Ok(vec![10, 11]) })
        .await;
    let unrelated = CachedQuery::new("posts_by_user").depends_on("user", &[&2]);
    let _: Result<Vec<u32>, ()> = records
        .cached(&unrelated, &[&2], || async { Ok(vec![20]) })
        .await;

    assert_eq!(records.invalidate("user", &[&1]).await, 2);
    assert!(store.get("data:user:1").await.unwrap().is_none());
    assert!(store.get("data:posts_by_user:1").await.unwrap().is_none());
    assert!(store.get("data:posts_by_user:2").await.unwrap().is_some());
}

#[tokio::test]
async fn group_invalidation_removes_every_member() {
    let (store, engine) = engine();
    let records = engine.records();
    let feed = CachedQuery::new("feed").group("homepage");
    let trending = CachedQuery::new("trending").group("homepage");

    let _: Result<u32, ()> = records.cached(&feed, &[&"latest"], || async { Ok(1) }).await;
    let _: Result<u32, ()> = records.cached(&trending, &[&7], || async { Ok(2) }).await;

    assert_eq!(records.invalidate_group("homepage").await, 2);
    assert!(store.get("data:feed:latest").await.unwrap().is_none());
    assert!(store.get("data:trending:7").await.unwrap().is_none());
    assert_eq!(records.invalidate_group("homepage").await, 0);

    let stats = records.get_stats().await;
    assert_eq!(stats.group_invalidations, 2);
}

#[tokio::test]
async fn pattern_invalidation_stays_inside_the_namespace() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let config = CacheConfig {
        namespace: "blog:".to_string(),
        ..Default::default()
    };
    let engine = CacheEngine::new(Arc::clone(&store), config);
    store
        .set("data:user:1", Bytes::from_static(b"1"), None)
        .await
        .unwrap();
    let _: Result<u32, ()> = engine
        .records()
        .cached(&CachedQuery::new("user"), &[&1], || async { Ok(1) })
        .await;

    assert_eq!(engine.records().invalidate_pattern("data:user:*").await, 1);
    assert!(store.get("data:user:1").await.unwrap().is_some());
    assert!(store.get("blog:data:user:1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn lock_is_mutually_exclusive_and_owner_checked() {
    let (store, engine) = engine();
    let lock = engine.lock();

    let guard = lock
        .acquire("post:7", Duration::from_millis(100), Duration::from_secs(10))
        .await
        .expect("first acquire");
    assert!(store.get("lock:post:7").await.unwrap().is_some());

    let second = lock
        .acquire("post:7", Duration::from_millis(250), Duration::from_secs(10))
        .await;
    assert!(second.is_none());

    assert!(!lock.release("post:7", "not-the-owner").await);
    assert!(store.get("lock:post:7").await.unwrap().is_some());

    assert!(guard.release().await);
    assert!(
        lock.acquire("post:7", Duration::from_millis(100), Duration::from_secs(10))
            .await
            .is_some()
    );
}

#[tokio::test(start_paused = true)]
async fn waiter_takes_the_lock_as_soon_as_the_holder_releases() {
    let (_, engine) = engine();
    let lock = engine.lock().clone();

    let holder = lock
        .acquire("post:11", Duration::ZERO, Duration::from_secs(60))
        .await
        .expect("holder acquires");

    let contender = lock.clone();
    let waiter = tokio::spawn(async move {
        contender
            .acquire("post:11", Duration::from_secs(5), Duration::from_secs(60))
            .await
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!waiter.is_finished());

    assert!(holder.release().await);
    let guard = waiter
        .await
        .expect("waiter task")
        .expect("waiter acquires after release");
    assert_eq!(guard.name(), "post:11");
    assert!(
        lock.acquire("post:11", Duration::ZERO, Duration::from_secs(60))
            .await
            .is_none()
    );
    assert!(guard.release().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_admit_exactly_one_holder() {
    let (_, engine) = engine();
    let contenders: Vec<_> = (0..8)
        .map(|_| {
            let lock = engine.lock().clone();
            tokio::spawn(async move {
                lock.acquire("post:12", Duration::ZERO, Duration::from_secs(60))
                    .await
            })
        })
        .collect();

    let mut holders = Vec::new();
    for contender in contenders {
        if let Some(guard) = contender.await.expect("contender task") {
            holders.push(guard);
        }
    }
    assert_eq!(holders.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_lease_frees_the_lock() {
    let (_, engine) = engine();
    let lock = engine.lock();

    let stale = lock
        .acquire("post:9", Duration::ZERO, Duration::from_secs(1))
        .await
        .expect("first acquire");
    tokio::time::advance(Duration::from_secs(2)).await;

    let fresh = lock
        .acquire("post:9", Duration::ZERO, Duration::from_secs(10))
        .await
        .expect("lease expired");
    assert!(!stale.release().await);
    assert!(fresh.release().await);
}

#[tokio::test]
async fn with_lock_holds_the_named_lock_for_the_write() {
    let (store, engine) = engine();
    let coordinator = engine.coordinator();

    let observed = coordinator
        .with_lock("post", 7, || async {
            store.get("lock:post:7").await.unwrap().is_some()
        })
        .await
        .expect("lock available");
    assert!(observed);
    assert!(store.get("lock:post:7").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn with_lock_refuses_the_write_while_held_elsewhere() {
    let (_, engine) = engine();
    let coordinator = engine.coordinator();
    let _held = coordinator
        .lock()
        .acquire("post:7", Duration::ZERO, Duration::from_secs(60))
        .await
        .expect("held");

    let wrote = AtomicBool::new(false);
    let result = coordinator
        .with_lock("post", 7, || async {
            wrote.store(true, Ordering::SeqCst);
        })
        .await;
    assert!(matches!(result, Err(CacheError::LockUnavailable { name }) if name == "post:7"));
    assert!(!wrote.load(Ordering::SeqCst));

    let fallback = coordinator
        .with_lock_or_else("post", 7, || async { "locked" }, || async { "fallback" })
        .await;
    assert_eq!(fallback, "fallback");
}

#[tokio::test(start_paused = true)]
async fn jittered_ttl_spreads_across_the_window() {
    let (store, engine) = engine();
    let coordinator = engine.coordinator();
    let mut ttls = Vec::new();

    for id in 0..200u32 {
        let value: Result<u32, ()> = coordinator
            .get_or_compute_with_jitter(
                "hot",
                &[&id],
                Duration::from_secs(100),
                Duration::from_secs(50),
                || async move { Ok(id) },
            )
            .await;
        assert_eq!(value, Ok(id));

        let KeyTtl::Expires(ttl) = store.ttl(&format!("data:hot:{id}")).await.unwrap() else {
            panic!("jittered entry must expire");
        };
        assert!(ttl >= Duration::from_secs(100), "ttl {ttl:?} below base");
        assert!(ttl <= Duration::from_secs(150), "ttl {ttl:?} above window");
        ttls.push(ttl.as_secs_f64());
    }

    let mean = ttls.iter().sum::<f64>() / ttls.len() as f64;
    assert!((mean - 125.0).abs() <= 125.0 * 0.05, "mean ttl {mean}");
    assert!(ttls.iter().any(|&ttl| ttl < 125.0));
    assert!(ttls.iter().any(|&ttl| ttl > 125.0));
}

#[tokio::test]
async fn membership_filter_short_circuits_unknown_ids() {
    let (_, engine) = engine();
    let coordinator = engine.coordinator();

    let before_seeding: Result<Option<u32>, ()> = coordinator
        .with_membership_filter("user", &[&404], || async { Ok(None) })
        .await;
    assert_eq!(before_seeding, Ok(None));

    assert_eq!(coordinator.seed_membership("user", &[1u32, 2, 3]).await, 3);

    let looked_up = AtomicBool::new(false);
    let unknown: Result<Option<u32>, ()> = coordinator
        .with_membership_filter("user", &[&404], || async {
            looked_up.store(true, Ordering::SeqCst);
            Ok(Some(404))
        })
        .await;
    assert_eq!(unknown, Ok(None));
    assert!(!looked_up.load(Ordering::SeqCst));

    let known: Result<Option<u32>, ()> = coordinator
        .with_membership_filter("user", &[&2], || async { Ok(Some(2)) })
        .await;
    assert_eq!(known, Ok(Some(2)));
}

#[tokio::test]
async fn counters_increment_atomically_from_zero() {
    let (store, engine) = engine();
    let counters = engine.counters();

    assert_eq!(counters.get("views", "post", 7).await, None);
    assert_eq!(counters.increment("views", "post", 7, 1).await, Some(1));
    assert_eq!(counters.increment("views", "post", 7, 4).await, Some(5));
    assert_eq!(counters.decrement("views", "post", 7, 2).await, Some(3));
    assert_eq!(counters.get_or("views", "post", 8, 0).await, 0);

    assert!(matches!(
        store.ttl("count:views:post:7").await.unwrap(),
        KeyTtl::Expires(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn double_delete_removes_a_value_repopulated_during_the_write() {
    let (store, engine) = engine();
    let records = engine.records();
    let key = records.make_key("post", &[&7]).unwrap();
    assert!(records.put(&key, &"v1", None).await);

    let stale_reader = Arc::clone(&store);
    let stale_key = key.clone();
    engine
        .coordinator()
        .write_with_double_delete(&key, || async move {
            stale_reader
                .set(stale_key.as_str(), Bytes::from_static(b"\"v1\""), None)
                .await
                .unwrap();
        })
        .await;
    assert!(store.get(key.as_str()).await.unwrap().is_some());

    assert!(engine.shutdown(Duration::from_secs(5)).await);
    assert!(store.get(key.as_str()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn invalidate_then_delay_deletes_twice() {
    let (store, engine) = engine();
    let key = engine.records().make_key("post", &[&8]).unwrap();
    store
        .set(key.as_str(), Bytes::from_static(b"1"), None)
        .await
        .unwrap();

    let handle = engine
        .coordinator()
        .invalidate_then_delay(&key, Some(Duration::from_millis(200)))
        .await;
    assert!(store.get(key.as_str()).await.unwrap().is_none());

    store
        .set(key.as_str(), Bytes::from_static(b"1"), None)
        .await
        .unwrap();
    assert!(handle.join().await);
    assert!(store.get(key.as_str()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn refresh_happens_in_the_background_near_expiry() {
    let (_, engine) = engine();
    let coordinator = engine.coordinator();
    let ttl = Duration::from_secs(100);

    let first: Result<String, String> = coordinator
        .refresh_before_expiry("config", &[&"site"], ttl, || async {
            Ok("v1".to_string())
        })
        .await;
    assert_eq!(first.as_deref(), Ok("v1"));

    tokio::time::advance(Duration::from_secs(10)).await;
    let early: Result<String, String> = coordinator
        .refresh_before_expiry("config", &[&"site"], ttl, || async {
            Ok("unexpected".to_string())
        })
        .await;
    assert_eq!(early.as_deref(), Ok("v1"));

    tokio::time::advance(Duration::from_secs(30)).await;
    let stale: Result<String, String> = coordinator
        .refresh_before_expiry("config", &[&"site"], ttl, || async {
            Ok("v2".to_string())
        })
        .await;
    assert_eq!(stale.as_deref(), Ok("v1"));

    assert!(engine.shutdown(Duration::from_secs(5)).await);
    let key = engine.records().make_key("config", &[&"site"]).unwrap();
    assert_eq!(
        engine.records().get::<String>(&key).await.as_deref(),
        Some("v2")
    );
}
