//! Hit/miss accounting shared by the cache front-ends.
//!
//! Counters are kept in process for `get_stats()` and mirrored to the
//! `metrics` facade so an installed recorder sees the same events.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

pub(crate) const METRIC_HIT: &str = "cachekeeper_cache_hit_total";
pub(crate) const METRIC_MISS: &str = "cachekeeper_cache_miss_total";
pub(crate) const METRIC_STORE: &str = "cachekeeper_cache_store_total";
pub(crate) const METRIC_ERROR: &str = "cachekeeper_cache_error_total";
pub(crate) const METRIC_INVALIDATED: &str = "cachekeeper_cache_invalidated_total";
pub(crate) const METRIC_LOCK_ACQUIRED: &str = "cachekeeper_lock_acquired_total";
pub(crate) const METRIC_LOCK_CONTENDED: &str = "cachekeeper_lock_contended_total";
pub(crate) const METRIC_LOCK_WAIT_MS: &str = "cachekeeper_lock_wait_ms";
pub(crate) const METRIC_FILTER_REJECTED: &str = "cachekeeper_filter_rejected_total";
pub(crate) const METRIC_REFRESH: &str = "cachekeeper_refresh_total";
pub(crate) const METRIC_GOVERNOR_EVICTED: &str = "cachekeeper_governor_evicted_total";
pub(crate) const METRIC_GOVERNOR_RUN_MS: &str = "cachekeeper_governor_run_ms";

/// Point-in-time copy of a [`HitCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HitStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
}

impl HitStats {
    /// `hits / (hits + misses)`, zero before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

/// Lock-free hit/miss/store/error counters for one cache (or one category).
#[derive(Debug)]
pub struct HitCounters {
    cache: &'static str,
    label: &'static str,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

impl HitCounters {
    /// `cache` names the front-end (`record`, `entry`, ...), `label` the
    /// category within it.
    pub fn new(cache: &'static str, label: &'static str) -> Self {
        Self {
            cache,
            label,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT, "cache" => self.cache, "category" => self.label).increment(1);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS, "cache" => self.cache, "category" => self.label).increment(1);
    }

    pub fn store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STORE, "cache" => self.cache, "category" => self.label).increment(1);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ERROR, "cache" => self.cache, "category" => self.label).increment(1);
    }

    pub fn snapshot(&self) -> HitStats {
        HitStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
