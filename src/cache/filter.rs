//! Membership filters for cache-penetration protection.
//!
//! A filter answers "definitely absent" for lookups of ids that were never
//! seen. An empty filter answers "maybe" for everything, so lookups pass
//! through until the filter has been seeded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::keys::CacheKey;
use crate::store::{KeyValueStore, StoreError};

#[async_trait]
pub trait MembershipFilter: Send + Sync {
    /// Whether the filter has been seeded and may reject lookups.
    async fn is_active(&self) -> Result<bool, StoreError>;

    /// `false` means the item was certainly never inserted.
    async fn might_contain(&self, item: &str) -> Result<bool, StoreError>;

    async fn insert(&self, items: &[String]) -> Result<(), StoreError>;
}

/// Exact membership kept as a set in the shared store.
///
/// Never reports false positives; grows with the number of items.
pub struct StoreSetFilter {
    store: Arc<dyn KeyValueStore>,
    key: CacheKey,
}

impl StoreSetFilter {
    pub fn new(store: Arc<dyn KeyValueStore>, key: CacheKey) -> Self {
        Self { store, key }
    }
}

#[async_trait]
impl MembershipFilter for StoreSetFilter {
    async fn is_active(&self) -> Result<bool, StoreError> {
        Ok(self.store.set_len(self.key.as_str()).await? > 0)
    }

    async fn might_contain(&self, item: &str) -> Result<bool, StoreError> {
        self.store.set_contains(self.key.as_str(), item).await
    }

    async fn insert(&self, items: &[String]) -> Result<(), StoreError> {
        self.store.set_add(self.key.as_str(), items).await?;
        Ok(())
    }
}

/// Fixed-size in-process Bloom filter.
///
/// Sized for `capacity` items at the requested false-positive rate; past
/// capacity the rate degrades but lookups never report false negatives.
#[derive(Debug)]
pub struct BloomFilter {
    words: Vec<AtomicU64>,
    bit_count: u64,
    hash_count: u32,
    inserted: AtomicU64,
}

impl BloomFilter {
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let (bit_count, hash_count) = bloom_parameters(capacity, false_positive_rate);
        let word_count = bit_count.div_ceil(64) as usize;
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            bit_count,
            hash_count,
            inserted: AtomicU64::new(0),
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Items inserted so far, counting repeats.
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(item.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        second.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(first);
        let h2 = u64::from_le_bytes(second) | 1;
        (0..u64::from(self.hash_count))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count)
    }

    fn set_bit(&self, position: u64) {
        let word = &self.words[(position / 64) as usize];
        word.fetch_or(1 << (position % 64), Ordering::Relaxed);
    }

    fn bit(&self, position: u64) -> bool {
        let word = self.words[(position / 64) as usize].load(Ordering::Relaxed);
        word & (1 << (position % 64)) != 0
    }

    pub fn insert_item(&self, item: &str) {
        for position in self.positions(item) {
            self.set_bit(position);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn contains_item(&self, item: &str) -> bool {
        self.positions(item).all(|position| self.bit(position))
    }
}

#[async_trait]
impl MembershipFilter for BloomFilter {
    async fn is_active(&self) -> Result<bool, StoreError> {
        Ok(self.inserted() > 0)
    }

    async fn might_contain(&self, item: &str) -> Result<bool, StoreError> {
        Ok(self.contains_item(item))
    }

    async fn insert(&self, items: &[String]) -> Result<(), StoreError> {
        for item in items {
            self.insert_item(item);
        }
        Ok(())
    }
}

/// Bit count `m = -n ln p / (ln 2)^2` and hash count `k = (m / n) ln 2`.
fn bloom_parameters(capacity: usize, false_positive_rate: f64) -> (u64, u32) {
    let n = capacity.max(1) as f64;
    let p = false_positive_rate.clamp(1e-9, 0.5);
    let ln2 = std::f64::consts::LN_2;
    let bits = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0);
    let hashes = ((bits / n) * ln2).round().clamp(1.0, 32.0);
    (bits as u64, hashes as u32)
}
