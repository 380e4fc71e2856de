use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cachekeeper::cache::{CacheConfig, CacheEngine, GovernorConfig, ImageCategory};
use cachekeeper::store::{KeyValueStore, MemoryStore};

const COVER_URLS: [&str; 4] = [
    "https://cdn.example.com/cover/1.png",
    "https://cdn.example.com/cover/2.png",
    "https://cdn.example.com/cover/3.png",
    "https://cdn.example.com/cover/4.png",
];

const PROFILE_URLS: [&str; 2] = [
    "https://cdn.example.com/avatars/ada.png",
    "https://cdn.example.com/avatars/grace.png",
];

fn engine_with(max_memory: u64, governor: GovernorConfig) -> (Arc<MemoryStore>, CacheEngine) {
    let store = Arc::new(MemoryStore::with_max_memory(max_memory));
    let shared: Arc<dyn KeyValueStore> = store.clone();
    let config = CacheConfig {
        governor,
        ..Default::default()
    };
    (store, CacheEngine::new(shared, config))
}

async fn fill_covers(engine: &CacheEngine) {
    let ttls = [10, 20, 300, 400];
    for (url, ttl) in COVER_URLS.iter().zip(ttls) {
        assert!(
            engine
                .entries()
                .set(
                    url,
                    Bytes::from(vec![7u8; 400]),
                    "image/png",
                    Some(ImageCategory::Cover),
                    Some(Duration::from_secs(ttl)),
                )
                .await
        );
    }
}

#[tokio::test]
async fn over_quota_category_loses_its_soonest_expiring_keys() {
    let governor = GovernorConfig {
        memory_threshold: 0.4,
        quotas: BTreeMap::from([("cover".to_string(), 0.5)]),
        ..Default::default()
    };
    let (store, engine) = engine_with(2000, governor);
    fill_covers(&engine).await;
    assert_eq!(store.len(), 4);

    assert!(engine.governor().check_and_enforce().await);

    assert_eq!(store.len(), 2);
    let entries = engine.entries();
    assert!(entries.get(COVER_URLS[0], None).await.is_none());
    assert!(entries.get(COVER_URLS[1], None).await.is_none());
    assert!(entries.get(COVER_URLS[2], None).await.is_some());
    assert!(entries.get(COVER_URLS[3], None).await.is_some());
}

#[tokio::test]
async fn categories_within_quota_keep_their_keys() {
    let governor = GovernorConfig {
        memory_threshold: 0.4,
        quotas: BTreeMap::from([("cover".to_string(), 0.3), ("profile".to_string(), 0.5)]),
        ..Default::default()
    };
    let (store, engine) = engine_with(4000, governor);
    fill_covers(&engine).await;
    for url in PROFILE_URLS {
        assert!(
            engine
                .entries()
                .set(
                    url,
                    Bytes::from(vec![1u8; 400]),
                    "image/png",
                    Some(ImageCategory::Profile),
                    Some(Duration::from_secs(5)),
                )
                .await
        );
    }
    assert_eq!(store.len(), 6);

    assert!(engine.governor().check_and_enforce().await);

    assert_eq!(store.len(), 4);
    let entries = engine.entries();
    for url in PROFILE_URLS {
        assert!(entries.get(url, Some(ImageCategory::Profile)).await.is_some());
    }
    assert!(entries.get(COVER_URLS[0], None).await.is_none());
    assert!(entries.get(COVER_URLS[1], None).await.is_none());
    assert!(entries.get(COVER_URLS[3], None).await.is_some());
}

#[tokio::test]
async fn usage_below_threshold_evicts_nothing() {
    let governor = GovernorConfig {
        memory_threshold: 0.9,
        ..Default::default()
    };
    let (store, engine) = engine_with(1_000_000, governor);
    fill_covers(&engine).await;

    assert!(engine.governor().check_and_enforce().await);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn without_quotas_a_random_share_is_dropped() {
    let governor = GovernorConfig {
        memory_threshold: 0.1,
        quotas: BTreeMap::new(),
        fallback_sample_fraction: 0.5,
        ..Default::default()
    };
    let (store, engine) = engine_with(2000, governor);
    fill_covers(&engine).await;

    assert!(engine.governor().check_and_enforce().await);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn without_a_ceiling_the_governor_stands_down() {
    let (store, engine) = engine_with(0, GovernorConfig::default());
    fill_covers(&engine).await;

    assert!(engine.governor().check_and_enforce().await);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn report_lists_usage_per_category() {
    let governor = GovernorConfig {
        memory_threshold: 0.8,
        ..Default::default()
    };
    let (_, engine) = engine_with(10_000, governor);
    fill_covers(&engine).await;

    let report = engine.governor().report().await.expect("report");
    assert_eq!(report.ceiling_bytes, Some(10_000));
    assert_eq!(report.threshold_bytes, Some(8_000));

    let cover = report
        .categories
        .iter()
        .find(|usage| usage.category == ImageCategory::Cover)
        .expect("cover usage");
    assert_eq!(cover.keys, 4);
    assert!(cover.estimate.total_bytes >= 4 * 400);
    assert_eq!(cover.quota_bytes, Some(2_000));
}
