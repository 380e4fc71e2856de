//! Cache engine configuration.
//!
//! Loaded from the `[cache]` table of `cachekeeper.toml`:
//!
//! ```toml
//! [cache]
//! namespace = "app:"
//! graph_backend = "store"
//!
//! [cache.lock]
//! lease_secs = 10
//!
//! [cache.governor.quotas]
//! article = 0.3
//! profile = 0.2
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

const DAY_SECS: u64 = 24 * 60 * 60;

const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_LOCK_LEASE_SECS: u64 = 10;
const DEFAULT_DOUBLE_DELETE_DELAY_MS: u64 = 500;
const DEFAULT_REFRESH_TTL_FRACTION: f64 = 0.75;
const DEFAULT_REFRESH_MARKER_TTL_SECS: u64 = 30;
const DEFAULT_JITTER_WINDOW_SECS: u64 = 300;
const DEFAULT_RECORD_TTL_SECS: u64 = 300;
const DEFAULT_COUNTER_TTL_SECS: u64 = 7 * DAY_SECS;
const DEFAULT_WORKER_CONCURRENCY: usize = 16;
const DEFAULT_BLOOM_CAPACITY: usize = 100_000;
const DEFAULT_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
const DEFAULT_SMALL_PAYLOAD_BYTES: usize = 100 * 1024;
const DEFAULT_LARGE_PAYLOAD_BYTES: usize = 1024 * 1024;
const DEFAULT_MEMORY_THRESHOLD: f64 = 0.8;
const DEFAULT_GOVERNOR_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_FALLBACK_SAMPLE_FRACTION: f64 = 0.1;

/// Where dependency edges and group memberships are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GraphBackend {
    /// Process-local maps; lost on restart, invisible to other instances.
    #[default]
    Memory,
    /// Sets in the shared store; visible to every instance.
    Store,
}

/// Which structure answers "definitely absent" for penetration protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterBackend {
    /// Exact hash set in the shared store.
    #[default]
    StoreSet,
    /// Fixed-size in-process Bloom filter.
    Bloom,
}

/// Cache engine configuration from `cachekeeper.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global prefix prepended to every key.
    pub namespace: String,
    pub graph_backend: GraphBackend,
    pub filter_backend: FilterBackend,
    /// Default TTL for record entries without an explicit one.
    pub default_record_ttl_secs: u64,
    /// TTL refreshed on every counter increment.
    pub counter_ttl_secs: u64,
    /// Maximum concurrently running background tasks.
    pub worker_concurrency: usize,
    pub lock: LockConfig,
    pub consistency: ConsistencyConfig,
    pub filter: BloomConfig,
    pub images: ImageConfig,
    pub governor: GovernorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub poll_interval_ms: u64,
    /// How long `with_lock` waits before dropping the write.
    pub timeout_ms: u64,
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub double_delete_delay_ms: u64,
    /// Refresh once remaining TTL drops below this fraction of the original.
    pub refresh_ttl_fraction: f64,
    pub refresh_marker_ttl_secs: u64,
    pub jitter_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    pub capacity: usize,
    pub false_positive_rate: f64,
}

/// Per-category TTL policy for the image cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub article_ttl_secs: u64,
    pub profile_ttl_secs: u64,
    pub cover_ttl_secs: u64,
    pub dynamic_ttl_secs: u64,
    pub general_ttl_secs: u64,
    /// TTL granted to small payloads.
    pub long_ttl_secs: u64,
    /// Upper bound for large payloads.
    pub large_ttl_cap_secs: u64,
    pub small_payload_bytes: usize,
    pub large_payload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Fraction of the ceiling above which quotas are enforced.
    pub memory_threshold: f64,
    /// Ceiling used when the store reports no `maxmemory`.
    pub memory_ceiling_bytes: Option<u64>,
    pub interval_secs: u64,
    /// Share of all image keys dropped when no quotas are configured.
    pub fallback_sample_fraction: f64,
    /// Category name to fraction of the ceiling.
    pub quotas: BTreeMap<String, f64>,
    /// Sum every key's size instead of sampling one per category.
    pub exact_sizes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            graph_backend: GraphBackend::default(),
            filter_backend: FilterBackend::default(),
            default_record_ttl_secs: DEFAULT_RECORD_TTL_SECS,
            counter_ttl_secs: DEFAULT_COUNTER_TTL_SECS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            lock: LockConfig::default(),
            consistency: ConsistencyConfig::default(),
            filter: BloomConfig::default(),
            images: ImageConfig::default(),
            governor: GovernorConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_LOCK_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lease_secs: DEFAULT_LOCK_LEASE_SECS,
        }
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            double_delete_delay_ms: DEFAULT_DOUBLE_DELETE_DELAY_MS,
            refresh_ttl_fraction: DEFAULT_REFRESH_TTL_FRACTION,
            refresh_marker_ttl_secs: DEFAULT_REFRESH_MARKER_TTL_SECS,
            jitter_window_secs: DEFAULT_JITTER_WINDOW_SECS,
        }
    }
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BLOOM_CAPACITY,
            false_positive_rate: DEFAULT_BLOOM_FALSE_POSITIVE_RATE,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            article_ttl_secs: 7 * DAY_SECS,
            profile_ttl_secs: 30 * DAY_SECS,
            cover_ttl_secs: 14 * DAY_SECS,
            dynamic_ttl_secs: 3 * DAY_SECS,
            general_ttl_secs: DAY_SECS,
            long_ttl_secs: 30 * DAY_SECS,
            large_ttl_cap_secs: 3 * DAY_SECS,
            small_payload_bytes: DEFAULT_SMALL_PAYLOAD_BYTES,
            large_payload_bytes: DEFAULT_LARGE_PAYLOAD_BYTES,
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let quotas = [
            ("article", 0.30),
            ("profile", 0.20),
            ("cover", 0.20),
            ("dynamic", 0.15),
            ("general", 0.15),
        ]
        .into_iter()
        .map(|(name, share)| (name.to_string(), share))
        .collect();

        Self {
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            memory_ceiling_bytes: None,
            interval_secs: DEFAULT_GOVERNOR_INTERVAL_SECS,
            fallback_sample_fraction: DEFAULT_FALLBACK_SAMPLE_FRACTION,
            quotas,
            exact_sizes: false,
        }
    }
}

impl CacheConfig {
    pub fn default_record_ttl(&self) -> Duration {
        Duration::from_secs(self.default_record_ttl_secs.max(1))
    }

    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_secs.max(1))
    }

    /// Worker concurrency clamped to at least one.
    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency.max(1)
    }
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(1))
    }
}

impl ConsistencyConfig {
    pub fn double_delete_delay(&self) -> Duration {
        Duration::from_millis(self.double_delete_delay_ms)
    }

    pub fn refresh_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_marker_ttl_secs.max(1))
    }

    pub fn jitter_window(&self) -> Duration {
        Duration::from_secs(self.jitter_window_secs)
    }

    /// Refresh fraction clamped into `[0, 1]`.
    pub fn refresh_fraction(&self) -> f64 {
        self.refresh_ttl_fraction.clamp(0.0, 1.0)
    }
}

impl GovernorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.namespace, "");
        assert_eq!(config.graph_backend, GraphBackend::Memory);
        assert_eq!(config.filter_backend, FilterBackend::StoreSet);
        assert_eq!(config.lock.poll_interval(), Duration::from_millis(100));
        assert_eq!(
            config.consistency.double_delete_delay(),
            Duration::from_millis(500)
        );
        assert!((config.consistency.refresh_ttl_fraction - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.images.small_payload_bytes, 100 * 1024);
        assert_eq!(config.images.large_ttl_cap_secs, 3 * DAY_SECS);
        assert_eq!(config.governor.interval(), Duration::from_secs(1800));
        assert_eq!(config.governor.quotas.len(), 5);
    }

    #[test]
    fn zero_values_are_clamped() {
        let config = CacheConfig {
            worker_concurrency: 0,
            default_record_ttl_secs: 0,
            lock: LockConfig {
                poll_interval_ms: 0,
                lease_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.worker_concurrency(), 1);
        assert_eq!(config.default_record_ttl(), Duration::from_secs(1));
        assert_eq!(config.lock.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.lock.lease(), Duration::from_secs(1));
    }

    #[test]
    fn refresh_fraction_is_clamped() {
        let consistency = ConsistencyConfig {
            refresh_ttl_fraction: 1.7,
            ..Default::default()
        };
        assert!((consistency.refresh_fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserializes_partial_tables() {
        let config: CacheConfig = serde_json::from_value(serde_json::json!({
            "namespace": "app:",
            "graph_backend": "store",
            "governor": { "quotas": { "article": 0.5 } }
        }))
        .expect("deserialize");
        assert_eq!(config.namespace, "app:");
        assert_eq!(config.graph_backend, GraphBackend::Store);
        assert_eq!(config.governor.quotas.len(), 1);
        assert!((config.governor.memory_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.lock.lease_secs, 10);
    }
}
