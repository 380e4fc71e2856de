//! Binary payload cache for externally fetched images.
//!
//! Entries are partitioned by [`ImageCategory`] and keyed by the SHA-256 of
//! the source URL. Each entry is one framed blob:
//!
//! ```text
//! [version: u8 = 1][content_type_len: u16 BE][content_type][payload]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, error, warn};
use url::Url;

use super::config::ImageConfig;
use super::error::CacheError;
use super::governor::MemoryGovernor;
use super::keys::{CacheKey, KeyScheme, sha256_hex};
use super::stats::{HitCounters, HitStats};
use crate::store::KeyValueStore;

const FRAME_VERSION: u8 = 1;
const FRAME_HEADER_LEN: usize = 3;

/// Content category of a cached image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Article,
    Profile,
    Cover,
    Dynamic,
    General,
}

/// Ordered URL rules; the first matching fragment decides the category.
const CLASSIFY_RULES: &[(&str, ImageCategory)] = &[
    ("/article", ImageCategory::Article),
    ("/avatar", ImageCategory::Profile),
    ("/profile", ImageCategory::Profile),
    ("/cover", ImageCategory::Cover),
    ("/banner", ImageCategory::Cover),
    ("/dynamic", ImageCategory::Dynamic),
    ("/moment", ImageCategory::Dynamic),
];

impl ImageCategory {
    pub const ALL: [Self; 5] = [
        Self::Article,
        Self::Profile,
        Self::Cover,
        Self::Dynamic,
        Self::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Profile => "profile",
            Self::Cover => "cover",
            Self::Dynamic => "dynamic",
            Self::General => "general",
        }
    }

    /// Categorize a URL by its path fragments.
    pub fn classify(url: &str) -> Self {
        CLASSIFY_RULES
            .iter()
            .find(|(fragment, _)| url.contains(fragment))
            .map(|(_, category)| *category)
            .unwrap_or(Self::General)
    }

    fn index(self) -> usize {
        self as usize
    }

    fn base_ttl_secs(self, config: &ImageConfig) -> u64 {
        match self {
            Self::Article => config.article_ttl_secs,
            Self::Profile => config.profile_ttl_secs,
            Self::Cover => config.cover_ttl_secs,
            Self::Dynamic => config.dynamic_ttl_secs,
            Self::General => config.general_ttl_secs,
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| format!("unknown image category `{value}`"))
    }
}

/// A cached payload with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub payload: Bytes,
    pub content_type: String,
}

impl CachedImage {
    pub fn encode(&self) -> Result<Bytes, CacheError> {
        let content_type = self.content_type.as_bytes();
        let ct_len = u16::try_from(content_type.len())
            .map_err(|_| CacheError::frame("content type longer than 65535 bytes"))?;

        let mut frame =
            BytesMut::with_capacity(FRAME_HEADER_LEN + content_type.len() + self.payload.len());
        frame.put_u8(FRAME_VERSION);
        frame.put_u16(ct_len);
        frame.put_slice(content_type);
        frame.put_slice(&self.payload);
        Ok(frame.freeze())
    }

    pub fn decode(frame: Bytes) -> Result<Self, CacheError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(CacheError::frame("frame shorter than its header"));
        }
        if frame[0] != FRAME_VERSION {
            return Err(CacheError::frame(format!(
                "unsupported frame version {}",
                frame[0]
            )));
        }
        let ct_len = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
        let body_start = FRAME_HEADER_LEN + ct_len;
        if frame.len() < body_start {
            return Err(CacheError::frame("content type runs past end of frame"));
        }
        let content_type = std::str::from_utf8(&frame[FRAME_HEADER_LEN..body_start])
            .map_err(|_| CacheError::frame("content type is not UTF-8"))?
            .to_string();
        Ok(Self {
            payload: frame.slice(body_start..),
            content_type,
        })
    }
}

/// Hit/miss counters for the whole cache and per category.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub total: HitStats,
    pub hit_ratio: f64,
    pub by_category: BTreeMap<ImageCategory, HitStats>,
}

/// Image cache over the shared store.
pub struct EntryCache {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
    config: ImageConfig,
    governor: Option<Arc<MemoryGovernor>>,
    totals: HitCounters,
    categories: [HitCounters; 5],
}

impl EntryCache {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyScheme, config: ImageConfig) -> Self {
        Self {
            store,
            keys,
            config,
            governor: None,
            totals: HitCounters::new("entry", "all"),
            categories: ImageCategory::ALL
                .map(|category| HitCounters::new("entry", category.as_str())),
        }
    }

    /// Run `governor` before storing large payloads.
    pub fn with_governor(mut self, governor: Arc<MemoryGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Store key for `url`, or `None` when the URL cannot be used as a key.
    pub fn key_for(&self, url: &str, category: ImageCategory) -> Option<CacheKey> {
        usable_url(url).then(|| self.keys.image(category.as_str(), &sha256_hex(url.as_bytes())))
    }

    /// TTL applied to a payload of `payload_len` bytes.
    pub fn effective_ttl(
        &self,
        category: ImageCategory,
        payload_len: usize,
        explicit: Option<Duration>,
    ) -> Duration {
        if let Some(ttl) = explicit {
            return ttl;
        }
        let mut secs = category.base_ttl_secs(&self.config);
        if payload_len < self.config.small_payload_bytes {
            secs = secs.max(self.config.long_ttl_secs);
        } else if payload_len > self.config.large_payload_bytes {
            secs = secs.min(self.config.large_ttl_cap_secs);
        }
        Duration::from_secs(secs.max(1))
    }

    pub async fn get(&self, url: &str, category: Option<ImageCategory>) -> Option<CachedImage> {
        let category = category.unwrap_or_else(|| ImageCategory::classify(url));
        let key = self.key_for(url, category)?;

        if let Some(image) = self.load(key.as_str(), category).await {
            self.hit(category);
            return Some(image);
        }

        let legacy = self.keys.legacy_image(&sha256_hex(url.as_bytes()));
        let Some(image) = self.load(legacy.as_str(), category).await else {
            self.miss(category);
            return None;
        };

        self.promote(&key, legacy.as_str(), &image, category).await;
        self.hit(category);
        Some(image)
    }

    pub async fn set(
        &self,
        url: &str,
        payload: Bytes,
        content_type: &str,
        category: Option<ImageCategory>,
        ttl: Option<Duration>,
    ) -> bool {
        let category = category.unwrap_or_else(|| ImageCategory::classify(url));
        let Some(key) = self.key_for(url, category) else {
            debug!(url, "url not usable as cache key; skipping");
            return false;
        };

        let payload_len = payload.len();
        if payload_len > self.config.large_payload_bytes {
            if let Some(governor) = &self.governor {
                governor.check_and_enforce().await;
            }
        }

        let image = CachedImage {
            payload,
            content_type: content_type.to_string(),
        };
        let frame = match image.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(key = %key, category = %category, error = %err, "image entry not encodable");
                self.error(category);
                return false;
            }
        };

        let ttl = self.effective_ttl(category, payload_len, ttl);
        match self.store.set(key.as_str(), frame, Some(ttl)).await {
            Ok(()) => {
                self.totals.store();
                self.categories[category.index()].store();
                debug!(
                    key = %key,
                    category = %category,
                    bytes = payload_len,
                    ttl_secs = ttl.as_secs(),
                    "image cached"
                );
                true
            }
            Err(err) => {
                error!(key = %key, category = %category, error = %err, "image store failed");
                self.error(category);
                false
            }
        }
    }

    pub async fn delete(&self, url: &str, category: Option<ImageCategory>) -> bool {
        let category = category.unwrap_or_else(|| ImageCategory::classify(url));
        let Some(key) = self.key_for(url, category) else {
            return false;
        };
        match self.store.delete(key.as_str()).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(key = %key, error = %err, "image delete failed");
                self.error(category);
                false
            }
        }
    }

    pub fn get_stats(&self) -> EntryStats {
        let total = self.totals.snapshot();
        EntryStats {
            total,
            hit_ratio: total.hit_ratio(),
            by_category: ImageCategory::ALL
                .into_iter()
                .map(|category| (category, self.categories[category.index()].snapshot()))
                .collect(),
        }
    }

    async fn load(&self, key: &str, category: ImageCategory) -> Option<CachedImage> {
        let frame = match self.store.get(key).await {
            Ok(frame) => frame?,
            Err(err) => {
                error!(key, category = %category, error = %err, "image read failed");
                self.error(category);
                return None;
            }
        };
        match CachedImage::decode(frame) {
            Ok(image) => Some(image),
            Err(err) => {
                warn!(key, category = %category, error = %err, "dropping malformed image entry");
                self.error(category);
                None
            }
        }
    }

    /// Copy a legacy entry under its categorized key, keeping its TTL.
    async fn promote(
        &self,
        key: &CacheKey,
        legacy_key: &str,
        image: &CachedImage,
        category: ImageCategory,
    ) {
        let ttl = match self.store.ttl(legacy_key).await {
            Ok(ttl) => ttl
                .remaining()
                .unwrap_or_else(|| self.effective_ttl(category, image.payload.len(), None)),
            Err(_) => self.effective_ttl(category, image.payload.len(), None),
        };
        let promoted = match image.encode() {
            Ok(frame) => self.store.set(key.as_str(), frame, Some(ttl)).await,
            Err(_) => return,
        };
        match promoted {
            Ok(()) => debug!(key = %key, legacy_key, "legacy image entry promoted"),
            Err(err) => warn!(key = %key, error = %err, "legacy image promotion failed"),
        }
    }

    fn hit(&self, category: ImageCategory) {
        self.totals.hit();
        self.categories[category.index()].hit();
    }

    fn miss(&self, category: ImageCategory) {
        self.totals.miss();
        self.categories[category.index()].miss();
    }

    fn error(&self, category: ImageCategory) {
        self.totals.error();
        self.categories[category.index()].error();
    }
}

/// Whether `url` is a string worth caching under.
fn usable_url(url: &str) -> bool {
    if url.trim().is_empty() || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    if url.contains("://") {
        return Url::parse(url).is_ok();
    }
    true
}
