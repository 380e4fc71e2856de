use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::{CacheConfig, FilterBackend, GraphBackend};
use super::coordinator::ConsistencyCoordinator;
use super::counter::CounterCache;
use super::entry::EntryCache;
use super::filter::{BloomFilter, MembershipFilter, StoreSetFilter};
use super::governor::MemoryGovernor;
use super::keys::KeyScheme;
use super::mutex::DistributedLock;
use super::record::RecordCache;
use super::registry::{GraphStore, InMemoryGraph, StoreGraph};
use super::tasks::TaskPool;
use crate::store::KeyValueStore;

const MEMBERSHIP_FILTER: &str = "membership";

/// Every cache component wired to one store and one configuration.
pub struct CacheEngine {
    config: CacheConfig,
    keys: KeyScheme,
    store: Arc<dyn KeyValueStore>,
    pool: TaskPool,
    records: Arc<RecordCache>,
    entries: Arc<EntryCache>,
    counters: Arc<CounterCache>,
    coordinator: Arc<ConsistencyCoordinator>,
    governor: Arc<MemoryGovernor>,
}

impl CacheEngine {
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let keys = KeyScheme::new(&config.namespace);
        let pool = TaskPool::new(config.worker_concurrency());

        let graph: Arc<dyn GraphStore> = match config.graph_backend {
            GraphBackend::Memory => Arc::new(InMemoryGraph::new()),
            GraphBackend::Store => Arc::new(StoreGraph::new(Arc::clone(&store), keys.clone())),
        };
        let filter: Arc<dyn MembershipFilter> = match config.filter_backend {
            FilterBackend::StoreSet => Arc::new(StoreSetFilter::new(
                Arc::clone(&store),
                keys.filter(MEMBERSHIP_FILTER),
            )),
            FilterBackend::Bloom => Arc::new(BloomFilter::new(
                config.filter.capacity,
                config.filter.false_positive_rate,
            )),
        };

        let governor = Arc::new(MemoryGovernor::new(
            Arc::clone(&store),
            keys.clone(),
            config.governor.clone(),
        ));
        let records = Arc::new(RecordCache::new(
            Arc::clone(&store),
            keys.clone(),
            graph,
            config.default_record_ttl(),
        ));
        let entries = Arc::new(
            EntryCache::new(Arc::clone(&store), keys.clone(), config.images.clone())
                .with_governor(Arc::clone(&governor)),
        );
        let counters = Arc::new(CounterCache::new(
            Arc::clone(&store),
            keys.clone(),
            config.counter_ttl(),
        ));
        let coordinator = Arc::new(ConsistencyCoordinator::new(
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&records),
            filter,
            pool.clone(),
            &config,
        ));

        info!(
            namespace = %config.namespace,
            graph_backend = ?config.graph_backend,
            filter_backend = ?config.filter_backend,
            workers = config.worker_concurrency(),
            "cache engine ready"
        );

        Self {
            config,
            keys,
            store,
            pool,
            records,
            entries,
            counters,
            coordinator,
            governor,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn records(&self) -> &Arc<RecordCache> {
        &self.records
    }

    pub fn entries(&self) -> &Arc<EntryCache> {
        &self.entries
    }

    pub fn counters(&self) -> &Arc<CounterCache> {
        &self.counters
    }

    pub fn coordinator(&self) -> &Arc<ConsistencyCoordinator> {
        &self.coordinator
    }

    pub fn lock(&self) -> &DistributedLock {
        self.coordinator.lock()
    }

    pub fn governor(&self) -> &Arc<MemoryGovernor> {
        &self.governor
    }

    /// Start the periodic governor loop at the configured interval.
    pub fn spawn_governor(&self) -> JoinHandle<()> {
        Arc::clone(&self.governor).spawn_periodic(self.config.governor.interval())
    }

    /// Abort a loop started by [`spawn_governor`](Self::spawn_governor) and
    /// wait for it to wind down. Returns `false` if the loop had panicked.
    pub async fn stop_governor(handle: JoinHandle<()>) -> bool {
        handle.abort();
        match handle.await {
            Ok(()) => true,
            Err(err) if err.is_cancelled() => true,
            Err(err) => {
                warn!(error = %err, "memory governor task failed");
                false
            }
        }
    }

    /// Wait up to `timeout` for background refreshes and delayed deletes.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.pool.shutdown(timeout).await;
        info!(drained, "cache engine stopped");
        drained
    }
}
