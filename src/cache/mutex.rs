//! Distributed mutual exclusion over the shared store.
//!
//! A lock is the key `lock:{name}` holding a random owner token with a TTL
//! equal to the lease. Acquisition polls `set_if_not_exists`; release and
//! extension only act while the stored token still matches, so an expired
//! holder can never free a lock someone else has since taken.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::config::LockConfig;
use super::keys::{CacheKey, KeyScheme};
use super::stats::{METRIC_LOCK_ACQUIRED, METRIC_LOCK_CONTENDED, METRIC_LOCK_WAIT_MS};
use crate::store::KeyValueStore;

/// Store-backed lock manager.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
    poll_interval: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyScheme, config: &LockConfig) -> Self {
        Self {
            store,
            keys,
            poll_interval: config.poll_interval(),
        }
    }

    /// Try to take `lock_name` for `lease`, polling until `timeout` elapses.
    ///
    /// Returns `None` on timeout or when the store is unreachable.
    pub async fn acquire(
        &self,
        lock_name: &str,
        timeout: Duration,
        lease: Duration,
    ) -> Option<LockGuard> {
        let key = self.keys.lock(lock_name);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            match self
                .store
                .set_if_not_exists(key.as_str(), Bytes::from(token.clone()), lease)
                .await
            {
                Ok(true) => {
                    counter!(METRIC_LOCK_ACQUIRED).increment(1);
                    histogram!(METRIC_LOCK_WAIT_MS)
                        .record(started.elapsed().as_secs_f64() * 1000.0);
                    debug!(lock = lock_name, "lock acquired");
                    return Some(LockGuard {
                        store: Arc::clone(&self.store),
                        key,
                        name: lock_name.to_string(),
                        token,
                        released: false,
                    });
                }
                Ok(false) => {}
                Err(err) => {
                    error!(lock = lock_name, error = %err, "lock acquisition failed");
                    return None;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                counter!(METRIC_LOCK_CONTENDED).increment(1);
                warn!(
                    lock = lock_name,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "lock acquisition timed out"
                );
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release `lock_name` if it is still held with `owner_token`.
    pub async fn release(&self, lock_name: &str, owner_token: &str) -> bool {
        let key = self.keys.lock(lock_name);
        release_owned(self.store.as_ref(), key.as_str(), lock_name, owner_token).await
    }
}

async fn release_owned(
    store: &dyn KeyValueStore,
    key: &str,
    lock_name: &str,
    token: &str,
) -> bool {
    match store.delete_if_equals(key, token.as_bytes()).await {
        Ok(true) => {
            debug!(lock = lock_name, "lock released");
            true
        }
        Ok(false) => {
            warn!(
                lock = lock_name,
                "lock not released: expired or owned by another holder"
            );
            false
        }
        Err(err) => {
            error!(lock = lock_name, error = %err, "lock release failed");
            false
        }
    }
}

/// Ownership of an acquired lock.
///
/// Dropping the guard without calling [`LockGuard::release`] schedules a
/// best-effort release on the current tokio runtime.
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    key: CacheKey,
    name: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Reset the lease to `lease` from now, if the lock is still ours.
    pub async fn extend(&self, lease: Duration) -> bool {
        match self
            .store
            .expire_if_equals(self.key.as_str(), self.token.as_bytes(), lease)
            .await
        {
            Ok(extended) => {
                if !extended {
                    warn!(lock = %self.name, "lease not extended: lock no longer owned");
                }
                extended
            }
            Err(err) => {
                error!(lock = %self.name, error = %err, "lease extension failed");
                false
            }
        }
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        release_owned(self.store.as_ref(), self.key.as_str(), &self.name, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "lock guard dropped outside a runtime; lease will expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            release_owned(store.as_ref(), key.as_str(), &name, &token).await;
        });
    }
}
