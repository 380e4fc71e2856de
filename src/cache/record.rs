//! Structured result cache with dependency and group invalidation.
//!
//! Values are stored as JSON under `data:{prefix}:{args}`. A cached query
//! may declare other record keys it depends on; invalidating one of those
//! drops this entry as well (one hop). Queries may also join a named group
//! that can be dropped in bulk.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::error::CacheError;
use super::keys::{CacheKey, CacheKeyable, KeyScheme, logical_key};
use super::registry::GraphStore;
use super::stats::{HitCounters, METRIC_INVALIDATED};
use crate::store::KeyValueStore;

/// How a query result is cached.
#[derive(Debug, Clone)]
pub struct CachedQuery {
    prefix: String,
    ttl: Option<Duration>,
    depends_on: Vec<String>,
    group: Option<String>,
}

impl CachedQuery {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ttl: None,
            depends_on: Vec::new(),
            group: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Invalidate this entry whenever the record `prefix(args)` is invalidated.
    ///
    /// Arguments that cannot form a key are logged and the dependency is skipped.
    pub fn depends_on(mut self, prefix: &str, args: &[&dyn CacheKeyable]) -> Self {
        match logical_key(prefix, args) {
            Ok(logical) => self.depends_on.push(logical),
            Err(err) => warn!(query = %self.prefix, error = %err, "dependency skipped"),
        }
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Counters and index sizes reported by [`RecordCache::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecordStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
    pub invalidations: u64,
    pub group_invalidations: u64,
    pub hit_ratio: f64,
    pub groups: usize,
    pub dependency_roots: usize,
}

/// JSON result cache over the shared store.
pub struct RecordCache {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
    graph: Arc<dyn GraphStore>,
    default_ttl: Duration,
    counters: HitCounters,
    invalidations: AtomicU64,
    group_invalidations: AtomicU64,
}

impl RecordCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: KeyScheme,
        graph: Arc<dyn GraphStore>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            graph,
            default_ttl,
            counters: HitCounters::new("record", "all"),
            invalidations: AtomicU64::new(0),
            group_invalidations: AtomicU64::new(0),
        }
    }

    pub fn make_key(
        &self,
        prefix: &str,
        args: &[&dyn CacheKeyable],
    ) -> Result<CacheKey, CacheError> {
        self.keys.record(prefix, args)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the cached result for `query(args)`, computing and storing it
    /// on a miss.
    ///
    /// Errors from `compute` are returned unchanged and nothing is cached.
    /// Cache faults never fail the call; they fall back to `compute`.
    pub async fn cached<T, E, F, Fut>(
        &self,
        query: &CachedQuery,
        args: &[&dyn CacheKeyable],
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = match self.make_key(&query.prefix, args) {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    query = %query.prefix,
                    error = %err,
                    "uncacheable arguments; computing directly"
                );
                self.counters.error();
                return compute().await;
            }
        };

        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let value = compute().await?;
        if self.put(&key, &value, query.ttl).await {
            self.register(&key, query).await;
        }
        Ok(value)
    }

    /// Read and decode `key`, counting the hit or miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.store.get(key.as_str()).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(key = %key, error = %err, "record read failed");
                self.counters.error();
                None
            }
        };
        let Some(raw) = raw else {
            self.counters.miss();
            return None;
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => {
                self.counters.hit();
                Some(value)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "undecodable record entry treated as miss");
                self.counters.error();
                self.counters.miss();
                None
            }
        }
    }

    /// Encode and store `value` under `key`; `None` uses the default TTL.
    pub async fn put<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                warn!(key = %key, error = %err, "record value not serializable");
                self.counters.error();
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self.store.set(key.as_str(), encoded, Some(ttl)).await {
            Ok(()) => {
                self.counters.store();
                true
            }
            Err(err) => {
                error!(key = %key, error = %err, "record store failed");
                self.counters.error();
                false
            }
        }
    }

    async fn register(&self, key: &CacheKey, query: &CachedQuery) {
        let ttl = query.ttl.unwrap_or(self.default_ttl);
        for depended_on in &query.depends_on {
            let depended_on = self.keys.record_from_logical(depended_on);
            if let Err(err) = self
                .graph
                .add_edge(depended_on.as_str(), key.as_str(), ttl)
                .await
            {
                error!(
                    key = %key,
                    depends_on = %depended_on,
                    error = %err,
                    "dependency not recorded"
                );
            }
        }
        if let Some(group) = &query.group {
            if let Err(err) = self.graph.add_to_group(group, key.as_str(), ttl).await {
                error!(key = %key, group, error = %err, "group membership not recorded");
            }
        }
    }

    /// Drop `prefix(args)` and every entry that declared a dependency on it.
    /// Returns how many entries were removed.
    pub async fn invalidate(&self, prefix: &str, args: &[&dyn CacheKeyable]) -> usize {
        match self.make_key(prefix, args) {
            Ok(key) => self.invalidate_key(&key).await,
            Err(err) => {
                warn!(prefix, error = %err, "cannot invalidate: key not constructible");
                0
            }
        }
    }

    pub async fn invalidate_key(&self, key: &CacheKey) -> usize {
        let dependents = match self.graph.take_dependents(key.as_str()).await {
            Ok(dependents) => dependents,
            Err(err) => {
                error!(key = %key, error = %err, "dependents unavailable; invalidating key only");
                Vec::new()
            }
        };

        let mut doomed = Vec::with_capacity(dependents.len() + 1);
        doomed.push(key.as_str().to_string());
        doomed.extend(dependents);

        let removed = self.delete_keys(&doomed).await;
        for doomed_key in &doomed {
            if let Err(err) = self.graph.forget(doomed_key).await {
                debug!(key = %doomed_key, error = %err, "group cleanup skipped");
            }
        }

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_INVALIDATED, "scope" => "key").increment(removed as u64);
        if removed > 1 {
            info!(key = %key, removed, "invalidated entry and its dependents");
        }
        removed
    }

    /// Drop every member of `group`. Returns how many entries were removed.
    pub async fn invalidate_group(&self, group: &str) -> usize {
        let members = match self.graph.take_group(group).await {
            Ok(members) => members,
            Err(err) => {
                error!(group, error = %err, "group members unavailable");
                return 0;
            }
        };
        let removed = self.delete_keys(&members).await;
        for member in &members {
            if let Err(err) = self.graph.forget(member).await {
                debug!(key = %member, error = %err, "group cleanup skipped");
            }
        }

        self.group_invalidations.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_INVALIDATED, "scope" => "group").increment(removed as u64);
        info!(group, removed, "group invalidated");
        removed
    }

    /// Delete every key in this namespace matching `pattern`, bypassing the
    /// dependency and group indexes.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let scoped = self.keys.scoped_pattern(pattern);
        let matched = match self.store.keys(&scoped).await {
            Ok(matched) => matched,
            Err(err) => {
                error!(pattern = %scoped, error = %err, "pattern scan failed");
                return 0;
            }
        };
        let removed = self.delete_keys(&matched).await;
        counter!(METRIC_INVALIDATED, "scope" => "pattern").increment(removed as u64);
        info!(pattern = %scoped, removed, "pattern invalidated");
        removed
    }

    async fn delete_keys(&self, keys: &[String]) -> usize {
        match self.store.delete_many(keys).await {
            Ok(removed) => usize::try_from(removed).unwrap_or(usize::MAX),
            Err(err) => {
                error!(count = keys.len(), error = %err, "bulk delete failed");
                self.counters.error();
                0
            }
        }
    }

    pub async fn get_stats(&self) -> RecordStats {
        let counts = self.counters.snapshot();
        let sizes = match self.graph.sizes().await {
            Ok(sizes) => sizes,
            Err(err) => {
                warn!(error = %err, "registry sizes unavailable");
                Default::default()
            }
        };
        RecordStats {
            hits: counts.hits,
            misses: counts.misses,
            stores: counts.stores,
            errors: counts.errors,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            group_invalidations: self.group_invalidations.load(Ordering::Relaxed),
            hit_ratio: counts.hit_ratio(),
            groups: sizes.groups,
            dependency_roots: sizes.depended_on,
        }
    }
}
