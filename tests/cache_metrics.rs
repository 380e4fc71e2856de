use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use cachekeeper::cache::{CacheConfig, CacheEngine, CachedQuery};
use cachekeeper::infra::telemetry;
use cachekeeper::store::{KeyValueStore, MemoryStore};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serial_test::serial;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

fn counter_total(name: &str) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}

fn engine() -> CacheEngine {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    CacheEngine::new(store, CacheConfig::default())
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let snapshotter = snapshotter();
    let engine = engine();
    let query = CachedQuery::new("user");

    for _ in 0..2 {
        let _: Result<u32, ()> = engine
            .records()
            .cached(&query, &[&1], || async { Ok(1) })
            .await;
    }
    engine.records().invalidate("user", &[&1]).await;

    let guard = engine
        .lock()
        .acquire("post:1", Duration::from_millis(10), Duration::from_secs(5))
        .await
        .expect("lock");
    assert!(
        engine
            .lock()
            .acquire("post:1", Duration::ZERO, Duration::from_secs(5))
            .await
            .is_none()
    );
    guard.release().await;

    engine.coordinator().seed_membership("user", &[1u32]).await;
    let _: Result<Option<u32>, ()> = engine
        .coordinator()
        .with_membership_filter("user", &[&2], || async { Ok(None) })
        .await;

    engine.governor().check_and_enforce().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "cachekeeper_cache_hit_total",
        "cachekeeper_cache_miss_total",
        "cachekeeper_cache_store_total",
        "cachekeeper_cache_invalidated_total",
        "cachekeeper_lock_acquired_total",
        "cachekeeper_lock_contended_total",
        "cachekeeper_lock_wait_ms",
        "cachekeeper_filter_rejected_total",
        "cachekeeper_governor_run_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn record_hits_are_counted_once_per_lookup() {
    let engine = engine();
    let before = counter_total("cachekeeper_cache_hit_total");
    let query = CachedQuery::new("profile");

    for _ in 0..4 {
        let _: Result<String, ()> = engine
            .records()
            .cached(&query, &[&"ada"], || async { Ok("ada".to_string()) })
            .await;
    }

    assert_eq!(counter_total("cachekeeper_cache_hit_total") - before, 3);
    let stats = engine.records().get_stats().await;
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
}
