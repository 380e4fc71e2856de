//! Cache consistency engine.
//!
//! Components, leaf to root:
//!
//! - [`DistributedLock`]: named mutual exclusion with owner-checked release
//! - [`EntryCache`]: categorized image payloads with size-aware TTLs
//! - [`RecordCache`]: JSON query results with dependency and group invalidation
//! - [`CounterCache`]: atomic scalar counters
//! - [`ConsistencyCoordinator`]: lock-guarded writes, double deletion, TTL
//!   jitter, membership filtering and background refresh
//! - [`MemoryGovernor`]: per-category memory quotas
//!
//! [`CacheEngine`] builds all of them from one [`CacheConfig`]:
//!
//! ```toml
//! [cache]
//! namespace = "blog:"
//! graph_backend = "store"
//! filter_backend = "bloom"
//! ```

mod config;
mod coordinator;
mod counter;
mod engine;
mod entry;
mod error;
mod filter;
mod governor;
mod keys;
mod lock;
mod mutex;
mod record;
mod registry;
mod stats;
mod tasks;

pub(crate) use stats::{
    METRIC_ERROR, METRIC_FILTER_REJECTED, METRIC_GOVERNOR_EVICTED, METRIC_GOVERNOR_RUN_MS,
    METRIC_HIT, METRIC_INVALIDATED, METRIC_LOCK_ACQUIRED, METRIC_LOCK_CONTENDED,
    METRIC_LOCK_WAIT_MS, METRIC_MISS, METRIC_REFRESH, METRIC_STORE,
};

pub use config::{
    BloomConfig, CacheConfig, ConsistencyConfig, FilterBackend, GovernorConfig, GraphBackend,
    ImageConfig, LockConfig,
};
pub use coordinator::{ConsistencyCoordinator, jittered_ttl};
pub use counter::CounterCache;
pub use engine::CacheEngine;
pub use entry::{CachedImage, EntryCache, EntryStats, ImageCategory};
pub use error::CacheError;
pub use filter::{BloomFilter, MembershipFilter, StoreSetFilter};
pub use governor::{
    CategoryUsage, ExactSizeEstimator, MemoryGovernor, MemoryReport, SampledSizeEstimator,
    SizeEstimate, SizeEstimator,
};
pub use keys::{CacheKey, CacheKeyable, Hashed, Json, KeyScheme, logical_key, sha256_hex};
pub use mutex::{DistributedLock, LockGuard};
pub use record::{CachedQuery, RecordCache, RecordStats};
pub use registry::{GraphSizes, GraphStore, InMemoryGraph, StoreGraph};
pub use stats::{HitCounters, HitStats};
pub use tasks::{TaskHandle, TaskPool};
