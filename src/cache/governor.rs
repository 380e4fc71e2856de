//! Memory budget enforcement for the image cache.
//!
//! When store usage crosses `memory_threshold × ceiling`, each image
//! category is compared with its quota (a fraction of the ceiling) and
//! over-quota categories shed their soonest-to-expire keys. Without quotas
//! a random share of all image keys is dropped instead.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use metrics::{counter, histogram};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::GovernorConfig;
use super::entry::ImageCategory;
use super::keys::KeyScheme;
use super::stats::{METRIC_GOVERNOR_EVICTED, METRIC_GOVERNOR_RUN_MS};
use crate::store::{KeyTtl, KeyValueStore, MemoryInfo, StoreError};

/// Estimated footprint of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SizeEstimate {
    pub total_bytes: u64,
    /// Average bytes per key, never zero for a non-empty category.
    pub per_key_bytes: u64,
}

/// Strategy for sizing a category from its keys.
#[async_trait]
pub trait SizeEstimator: Send + Sync {
    async fn estimate(
        &self,
        store: &dyn KeyValueStore,
        keys: &[String],
    ) -> Result<SizeEstimate, StoreError>;
}

/// Sizes one key and assumes every key in the category is alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampledSizeEstimator;

/// Sums the size of every key. Accurate, one round trip per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactSizeEstimator;

async fn key_size(store: &dyn KeyValueStore, key: &str) -> Result<u64, StoreError> {
    if let Some(bytes) = store.memory_usage(key).await? {
        return Ok(bytes);
    }
    let value_len = store.get(key).await?.map_or(0, |value| value.len());
    Ok((key.len() + value_len) as u64)
}

#[async_trait]
impl SizeEstimator for SampledSizeEstimator {
    async fn estimate(
        &self,
        store: &dyn KeyValueStore,
        keys: &[String],
    ) -> Result<SizeEstimate, StoreError> {
        let Some(sample) = keys.first() else {
            return Ok(SizeEstimate::default());
        };
        let per_key_bytes = key_size(store, sample).await?.max(1);
        Ok(SizeEstimate {
            total_bytes: per_key_bytes.saturating_mul(keys.len() as u64),
            per_key_bytes,
        })
    }
}

#[async_trait]
impl SizeEstimator for ExactSizeEstimator {
    async fn estimate(
        &self,
        store: &dyn KeyValueStore,
        keys: &[String],
    ) -> Result<SizeEstimate, StoreError> {
        if keys.is_empty() {
            return Ok(SizeEstimate::default());
        }
        let mut total_bytes = 0u64;
        for key in keys {
            total_bytes = total_bytes.saturating_add(key_size(store, key).await?);
        }
        Ok(SizeEstimate {
            total_bytes,
            per_key_bytes: total_bytes.div_ceil(keys.len() as u64).max(1),
        })
    }
}

/// Usage of one category relative to its quota.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryUsage {
    pub category: ImageCategory,
    pub keys: usize,
    pub estimate: SizeEstimate,
    pub quota_bytes: Option<u64>,
}

/// Snapshot returned by [`MemoryGovernor::report`].
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub used_bytes: u64,
    pub ceiling_bytes: Option<u64>,
    pub threshold_bytes: Option<u64>,
    pub categories: Vec<CategoryUsage>,
}

/// Keeps image categories inside their memory quotas.
pub struct MemoryGovernor {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
    config: GovernorConfig,
    estimator: Box<dyn SizeEstimator>,
}

impl MemoryGovernor {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyScheme, config: GovernorConfig) -> Self {
        let estimator: Box<dyn SizeEstimator> = if config.exact_sizes {
            Box::new(ExactSizeEstimator)
        } else {
            Box::new(SampledSizeEstimator)
        };
        Self {
            store,
            keys,
            config,
            estimator,
        }
    }

    pub fn with_estimator(mut self, estimator: impl SizeEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    /// Check usage and evict over-quota keys.
    ///
    /// Returns `false` only when the store could not be queried.
    pub async fn check_and_enforce(&self) -> bool {
        let started = Instant::now();
        let outcome = self.enforce().await;
        histogram!(METRIC_GOVERNOR_RUN_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        match outcome {
            Ok(0) => true,
            Ok(evicted) => {
                info!(evicted, "memory governor evicted image entries");
                true
            }
            Err(err) => {
                error!(error = %err, "memory governor check failed");
                false
            }
        }
    }

    fn ceiling(&self, info: MemoryInfo) -> Option<u64> {
        if info.max > 0 {
            return Some(info.max);
        }
        self.config.memory_ceiling_bytes.filter(|ceiling| *ceiling > 0)
    }

    fn share(ceiling: u64, fraction: f64) -> u64 {
        (ceiling as f64 * fraction.max(0.0)) as u64
    }

    async fn enforce(&self) -> Result<u64, StoreError> {
        let info = self.store.info_memory().await?;
        let Some(ceiling) = self.ceiling(info) else {
            debug!(used = info.used, "no memory ceiling configured; nothing to enforce");
            return Ok(0);
        };
        let threshold = Self::share(ceiling, self.config.memory_threshold);
        if info.used <= threshold {
            debug!(used = info.used, threshold, "memory below threshold");
            return Ok(0);
        }
        warn!(used = info.used, threshold, ceiling, "memory above threshold; enforcing quotas");

        if self.config.quotas.is_empty() {
            return self.evict_random_sample().await;
        }

        let mut evicted = 0;
        for category in ImageCategory::ALL {
            let Some(&fraction) = self.config.quotas.get(category.as_str()) else {
                continue;
            };
            let keys = self
                .store
                .keys(&self.keys.image_pattern(Some(category.as_str())))
                .await?;
            if keys.is_empty() {
                continue;
            }
            let estimate = self.estimator.estimate(self.store.as_ref(), &keys).await?;
            let quota = Self::share(ceiling, fraction);
            if estimate.total_bytes <= quota {
                continue;
            }
            let excess = estimate.total_bytes - quota;
            let count = usize::try_from(excess.div_ceil(estimate.per_key_bytes))
                .unwrap_or(usize::MAX)
                .min(keys.len());
            debug!(
                category = %category,
                estimated = estimate.total_bytes,
                quota,
                count,
                "category over quota"
            );
            let removed = self.evict_soonest_expiring(keys, count).await?;
            counter!(METRIC_GOVERNOR_EVICTED, "category" => category.as_str()).increment(removed);
            evicted += removed;
        }
        Ok(evicted)
    }

    /// Delete `count` keys, lowest remaining TTL first, persistent keys last.
    async fn evict_soonest_expiring(
        &self,
        keys: Vec<String>,
        count: usize,
    ) -> Result<u64, StoreError> {
        if count == 0 {
            return Ok(0);
        }
        let store = self.store.as_ref();
        let lookups = keys.into_iter().map(|key| async move {
            let ttl = store.ttl(&key).await?;
            Ok::<_, StoreError>((key, ttl))
        });
        let mut ranked: Vec<(String, KeyTtl)> = try_join_all(lookups)
            .await?
            .into_iter()
            .filter(|(_, ttl)| !matches!(ttl, KeyTtl::Missing))
            .collect();
        ranked.sort_by(|(_, a), (_, b)| expiry_order(*a, *b));
        let doomed: Vec<String> = ranked.into_iter().take(count).map(|(key, _)| key).collect();
        self.store.delete_many(&doomed).await
    }

    async fn evict_random_sample(&self) -> Result<u64, StoreError> {
        let mut keys = self.store.keys(&self.keys.image_pattern(None)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let fraction = self.config.fallback_sample_fraction.clamp(0.0, 1.0);
        let count = ((keys.len() as f64) * fraction).ceil() as usize;
        keys.shuffle(&mut rand::rng());
        keys.truncate(count);
        let removed = self.store.delete_many(&keys).await?;
        counter!(METRIC_GOVERNOR_EVICTED, "category" => "sample").increment(removed);
        Ok(removed)
    }

    /// Current usage per category without evicting anything.
    pub async fn report(&self) -> Result<MemoryReport, StoreError> {
        let info = self.store.info_memory().await?;
        let ceiling = self.ceiling(info);
        let mut categories = Vec::with_capacity(ImageCategory::ALL.len());
        for category in ImageCategory::ALL {
            let keys = self
                .store
                .keys(&self.keys.image_pattern(Some(category.as_str())))
                .await?;
            let estimate = self.estimator.estimate(self.store.as_ref(), &keys).await?;
            let quota_bytes = match (ceiling, self.config.quotas.get(category.as_str())) {
                (Some(ceiling), Some(&fraction)) => Some(Self::share(ceiling, fraction)),
                _ => None,
            };
            categories.push(CategoryUsage {
                category,
                keys: keys.len(),
                estimate,
                quota_bytes,
            });
        }
        Ok(MemoryReport {
            used_bytes: info.used,
            ceiling_bytes: ceiling,
            threshold_bytes: ceiling
                .map(|ceiling| Self::share(ceiling, self.config.memory_threshold)),
            categories,
        })
    }

    /// Run [`check_and_enforce`](Self::check_and_enforce) every `interval`.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.check_and_enforce().await;
            }
        })
    }
}

fn expiry_order(a: KeyTtl, b: KeyTtl) -> Ordering {
    match (a, b) {
        (KeyTtl::Expires(a), KeyTtl::Expires(b)) => a.cmp(&b),
        (KeyTtl::Expires(_), _) => Ordering::Less,
        (_, KeyTtl::Expires(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
