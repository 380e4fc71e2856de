//! Cached scalar counters (likes, views, comment counts).
//!
//! These sit in front of a canonical count held elsewhere; losing one is
//! repaired by recomputation, so every fault degrades to `None`/`false`.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::error;

use super::keys::KeyScheme;
use crate::store::KeyValueStore;

/// Integer counters under `count:{counter_type}:{target_type}:{target_id}`.
pub struct CounterCache {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
    ttl: Duration,
}

impl CounterCache {
    /// `ttl` is reapplied on every increment.
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyScheme, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub async fn get(
        &self,
        counter_type: &str,
        target_type: &str,
        target_id: impl Display,
    ) -> Option<i64> {
        let key = self.keys.counter(counter_type, target_type, &target_id);
        let raw = match self.store.get(key.as_str()).await {
            Ok(raw) => raw?,
            Err(err) => {
                error!(key = %key, error = %err, "counter read failed");
                return None;
            }
        };
        match std::str::from_utf8(&raw).ok().and_then(|text| text.parse().ok()) {
            Some(value) => Some(value),
            None => {
                error!(key = %key, "counter holds a non-integer value");
                None
            }
        }
    }

    /// Counter value, or `default` when absent or unreadable.
    pub async fn get_or(
        &self,
        counter_type: &str,
        target_type: &str,
        target_id: impl Display,
        default: i64,
    ) -> i64 {
        self.get(counter_type, target_type, target_id)
            .await
            .unwrap_or(default)
    }

    pub async fn set(
        &self,
        counter_type: &str,
        target_type: &str,
        target_id: impl Display,
        value: i64,
        ttl: Option<Duration>,
    ) -> bool {
        let key = self.keys.counter(counter_type, target_type, &target_id);
        let ttl = ttl.unwrap_or(self.ttl);
        match self
            .store
            .set(key.as_str(), Bytes::from(value.to_string()), Some(ttl))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(key = %key, error = %err, "counter write failed");
                false
            }
        }
    }

    /// Atomically add `delta`; an absent counter starts from zero.
    pub async fn increment(
        &self,
        counter_type: &str,
        target_type: &str,
        target_id: impl Display,
        delta: i64,
    ) -> Option<i64> {
        let key = self.keys.counter(counter_type, target_type, &target_id);
        let value = match self.store.increment(key.as_str(), delta).await {
            Ok(value) => value,
            Err(err) => {
                error!(key = %key, delta, error = %err, "counter increment failed");
                return None;
            }
        };
        if let Err(err) = self.store.expire(key.as_str(), self.ttl).await {
            error!(key = %key, error = %err, "counter ttl refresh failed");
        }
        Some(value)
    }

    pub async fn decrement(
        &self,
        counter_type: &str,
        target_type: &str,
        target_id: impl Display,
        delta: i64,
    ) -> Option<i64> {
        let Some(negated) = delta.checked_neg() else {
            let key = self.keys.counter(counter_type, target_type, &target_id);
            error!(key = %key, delta, "counter decrement would overflow");
            return None;
        };
        self.increment(counter_type, target_type, target_id, negated)
            .await
    }
}
