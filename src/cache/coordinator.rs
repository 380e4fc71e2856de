//! Consistency protocols composed from the cache primitives.
//!
//! - lock-guarded writes ([`ConsistencyCoordinator::with_lock`])
//! - delayed double deletion around source-of-truth writes
//! - TTL jitter so entries populated together do not expire together
//! - membership filtering for ids that never exist
//! - background refresh of hot entries before they expire
//!
//! Per key, an entry moves `absent -> fresh -> stale but serving -> fresh`
//! (refresh completed) or `-> expired -> absent`. Explicit invalidation can
//! land at any point; the last write to the store wins.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use super::config::{CacheConfig, ConsistencyConfig, LockConfig};
use super::error::CacheError;
use super::filter::MembershipFilter;
use super::keys::{CacheKey, CacheKeyable, KeyScheme, logical_key, sha256_hex};
use super::mutex::DistributedLock;
use super::record::RecordCache;
use super::stats::{METRIC_FILTER_REJECTED, METRIC_REFRESH};
use super::tasks::{TaskHandle, TaskPool};
use crate::store::{KeyTtl, KeyValueStore, StoreError};

/// Orchestrates writes and populates so cache and source stay close.
pub struct ConsistencyCoordinator {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
    lock: DistributedLock,
    records: Arc<RecordCache>,
    filter: Arc<dyn MembershipFilter>,
    pool: TaskPool,
    lock_config: LockConfig,
    consistency: ConsistencyConfig,
}

impl ConsistencyCoordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: KeyScheme,
        records: Arc<RecordCache>,
        filter: Arc<dyn MembershipFilter>,
        pool: TaskPool,
        config: &CacheConfig,
    ) -> Self {
        let lock = DistributedLock::new(Arc::clone(&store), keys.clone(), &config.lock);
        Self {
            store,
            keys,
            lock,
            records,
            filter,
            pool,
            lock_config: config.lock.clone(),
            consistency: config.consistency.clone(),
        }
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Configured default for the `jitter_window` argument of
    /// [`get_or_compute_with_jitter`](Self::get_or_compute_with_jitter).
    pub fn default_jitter_window(&self) -> Duration {
        self.consistency.jitter_window()
    }

    /// Run `write` while holding the lock `{prefix}:{id}`.
    ///
    /// When the lock cannot be taken within the configured timeout the write
    /// is not performed and [`CacheError::LockUnavailable`] is returned.
    pub async fn with_lock<T, F, Fut>(
        &self,
        prefix: &str,
        id: impl Display,
        write: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let name = format!("{prefix}:{id}");
        let Some(guard) = self
            .lock
            .acquire(&name, self.lock_config.timeout(), self.lock_config.lease())
            .await
        else {
            warn!(lock = %name, "write dropped: lock unavailable");
            return Err(CacheError::lock_unavailable(name));
        };
        let output = write().await;
        guard.release().await;
        Ok(output)
    }

    /// Like [`with_lock`](Self::with_lock), but runs `fallback` instead of
    /// failing when the lock is unavailable.
    pub async fn with_lock_or_else<T, F, Fut, G, GFut>(
        &self,
        prefix: &str,
        id: impl Display,
        action: F,
        fallback: G,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = T>,
    {
        let name = format!("{prefix}:{id}");
        match self
            .lock
            .acquire(&name, self.lock_config.timeout(), self.lock_config.lease())
            .await
        {
            Some(guard) => {
                let output = action().await;
                guard.release().await;
                output
            }
            None => {
                debug!(lock = %name, "lock unavailable; using fallback");
                fallback().await
            }
        }
    }

    /// Delete `key` now and again after `delay` (default from config).
    ///
    /// Call before writing the source of truth; the second delete clears an
    /// entry a concurrent reader may have repopulated from stale data.
    pub async fn invalidate_then_delay(
        &self,
        key: &CacheKey,
        delay: Option<Duration>,
    ) -> TaskHandle {
        self.delete_now(key).await;
        self.schedule_delete(key, delay)
    }

    /// Delete `key`, run `write`, then delete `key` again after the
    /// configured delay.
    pub async fn write_with_double_delete<T, F, Fut>(&self, key: &CacheKey, write: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.delete_now(key).await;
        let output = write().await;
        self.schedule_delete(key, None);
        output
    }

    async fn delete_now(&self, key: &CacheKey) {
        if let Err(err) = self.store.delete(key.as_str()).await {
            error!(key = %key, error = %err, "first delete failed");
        }
    }

    fn schedule_delete(&self, key: &CacheKey, delay: Option<Duration>) -> TaskHandle {
        let delay = delay.unwrap_or_else(|| self.consistency.double_delete_delay());
        let store = Arc::clone(&self.store);
        let key = key.clone();
        self.pool.submit("double_delete", async move {
            tokio::time::sleep(delay).await;
            match store.delete(key.as_str()).await {
                Ok(removed) => debug!(key = %key, removed, "delayed delete done"),
                Err(err) => error!(key = %key, error = %err, "delayed delete failed"),
            }
        })
    }

    /// Cached `compute` whose TTL is `base_ttl` plus a uniform random share
    /// of `jitter_window`.
    pub async fn get_or_compute_with_jitter<T, E, F, Fut>(
        &self,
        key_prefix: &str,
        args: &[&dyn CacheKeyable],
        base_ttl: Duration,
        jitter_window: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = match self.records.make_key(key_prefix, args) {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    prefix = key_prefix,
                    error = %err,
                    "uncacheable arguments; computing directly"
                );
                return compute().await;
            }
        };
        if let Some(value) = self.records.get(&key).await {
            return Ok(value);
        }
        let value = compute().await?;
        let ttl = jittered_ttl(base_ttl, jitter_window);
        self.records.put(&key, &value, Some(ttl)).await;
        Ok(value)
    }

    /// Skip `lookup` for ids the membership filter has never seen.
    ///
    /// Once seeded, a definitely-absent id returns `Ok(None)` without calling
    /// `lookup`. Found values are added to the filter.
    pub async fn with_membership_filter<T, E, F, Fut>(
        &self,
        key_prefix: &str,
        args: &[&dyn CacheKeyable],
        lookup: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let item = match logical_key(key_prefix, args) {
            Ok(logical) => sha256_hex(logical.as_bytes()),
            Err(err) => {
                warn!(
                    prefix = key_prefix,
                    error = %err,
                    "membership key unavailable; filter bypassed"
                );
                return lookup().await;
            }
        };

        if self.definitely_absent(key_prefix, &item).await {
            return Ok(None);
        }

        let found = lookup().await?;
        if found.is_some() {
            if let Err(err) = self.filter.insert(std::slice::from_ref(&item)).await {
                error!(prefix = key_prefix, error = %err, "membership insert failed");
            }
        }
        Ok(found)
    }

    async fn definitely_absent(&self, key_prefix: &str, item: &str) -> bool {
        let checked = async {
            if !self.filter.is_active().await? {
                return Ok(false);
            }
            Ok::<_, StoreError>(!self.filter.might_contain(item).await?)
        };
        match checked.await {
            Ok(true) => {
                counter!(METRIC_FILTER_REJECTED).increment(1);
                debug!(prefix = key_prefix, "lookup rejected by membership filter");
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!(
                    prefix = key_prefix,
                    error = %err,
                    "membership check failed; passing through"
                );
                false
            }
        }
    }

    /// Register ids known to exist under `key_prefix`. Returns how many
    /// were submitted to the filter.
    pub async fn seed_membership<K: CacheKeyable>(&self, key_prefix: &str, ids: &[K]) -> usize {
        let items: Vec<String> = ids
            .iter()
            .filter_map(|id| logical_key(key_prefix, &[id]).ok())
            .map(|logical| sha256_hex(logical.as_bytes()))
            .collect();
        match self.filter.insert(&items).await {
            Ok(()) => items.len(),
            Err(err) => {
                error!(prefix = key_prefix, error = %err, "membership seeding failed");
                0
            }
        }
    }

    /// Cached `compute` that is recomputed in the background once less than
    /// the configured fraction of `ttl` remains. The current value is
    /// returned immediately.
    pub async fn refresh_before_expiry<T, E, F, Fut>(
        &self,
        key_prefix: &str,
        args: &[&dyn CacheKeyable],
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = match self.records.make_key(key_prefix, args) {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    prefix = key_prefix,
                    error = %err,
                    "uncacheable arguments; computing directly"
                );
                return compute().await;
            }
        };

        let Some(value) = self.records.get::<T>(&key).await else {
            let value = compute().await?;
            self.records.put(&key, &value, Some(ttl)).await;
            return Ok(value);
        };

        if self.needs_refresh(&key, ttl).await && self.claim_refresh(&key).await {
            self.spawn_refresh(key, ttl, compute);
        }
        Ok(value)
    }

    async fn needs_refresh(&self, key: &CacheKey, ttl: Duration) -> bool {
        let threshold = ttl.mul_f64(self.consistency.refresh_fraction());
        match self.store.ttl(key.as_str()).await {
            Ok(KeyTtl::Expires(remaining)) => remaining < threshold,
            Ok(KeyTtl::Missing | KeyTtl::Persistent) => false,
            Err(err) => {
                error!(key = %key, error = %err, "ttl lookup failed; refresh skipped");
                false
            }
        }
    }

    async fn claim_refresh(&self, key: &CacheKey) -> bool {
        let marker = self.keys.refresh_marker(key);
        match self
            .store
            .set_if_not_exists(
                marker.as_str(),
                Bytes::from_static(b"1"),
                self.consistency.refresh_marker_ttl(),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(key = %key, error = %err, "refresh marker unavailable");
                false
            }
        }
    }

    fn spawn_refresh<T, E, F, Fut>(&self, key: CacheKey, ttl: Duration, compute: F) -> TaskHandle
    where
        T: Serialize + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let records = Arc::clone(&self.records);
        let store = Arc::clone(&self.store);
        let marker = self.keys.refresh_marker(&key);
        self.pool.submit("refresh", async move {
            let result = match compute().await {
                Ok(value) => {
                    if records.put(&key, &value, Some(ttl)).await {
                        "refreshed"
                    } else {
                        "store_failed"
                    }
                }
                Err(err) => {
                    warn!(
                        key = %key,
                        error = %err,
                        "background refresh failed; serving until expiry"
                    );
                    "compute_failed"
                }
            };
            counter!(METRIC_REFRESH, "result" => result).increment(1);
            if let Err(err) = store.delete(marker.as_str()).await {
                debug!(key = %key, error = %err, "refresh marker left to expire");
            }
        })
    }
}

/// `base + uniform(0, window)`.
pub fn jittered_ttl(base: Duration, window: Duration) -> Duration {
    base + window.mul_f64(rand::random::<f64>())
}
