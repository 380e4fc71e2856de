//! Shared key-value store abstraction.
//!
//! Every durable piece of cache state lives behind [`KeyValueStore`]. The
//! engine only relies on primitives a Redis-compatible server offers:
//! TTL-aware get/set, atomic set-if-not-exists, atomic increment, pattern
//! enumeration, compare-and-delete and plain sets.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: single-process store used by tests and embedded setups.
//! - [`RedisStore`]: networked store built on a `redis` connection manager.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Errors raised by a [`KeyValueStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {message}")]
    Connection { message: String },
    #[error("store command `{command}` failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType { key: String },
    #[error("failed to decode store reply: {message}")]
    Decode { message: String },
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }

    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Remaining duration, if the key exists and expires.
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Self::Expires(remaining) => Some(remaining),
            Self::Missing | Self::Persistent => None,
        }
    }
}

/// Memory usage reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    /// Bytes currently in use.
    pub used: u64,
    /// Configured ceiling in bytes; zero when the store has no limit.
    pub max: u64,
}

/// Networked, shared, TTL-capable key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `value`, replacing any previous value. `None` means no expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every listed key, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Enumerate keys matching a glob pattern (`*`, `?`, `[...]`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Atomically store `value` only when `key` is absent.
    async fn set_if_not_exists(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomically add `delta`, treating an absent key as zero.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Reset the expiry of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Push the expiry of an existing key out to at least `ttl` from now.
    /// A key without an expiry receives one; a later expiry is kept.
    async fn extend_expiry(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// Reset the expiry of `key` only while it still holds `expected`.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn info_memory(&self) -> Result<MemoryInfo, StoreError>;

    /// Bytes attributed to a single key, if the store can tell.
    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically delete the set at `key` and return the members it held.
    async fn take_set(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_len(&self, key: &str) -> Result<u64, StoreError>;
}
