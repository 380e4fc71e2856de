//! Cache key construction.
//!
//! Every key is `namespace + category prefix + suffix`. Record keys derive
//! their suffix from call arguments through [`CacheKeyable`], so two calls with
//! the same logical arguments (in the same order) always land on the same key.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::CacheError;

/// Encoded argument parts longer than this are replaced by their digest.
const MAX_INLINE_PART: usize = 128;

const RECORD_PREFIX: &str = "data:";
const IMAGE_PREFIX: &str = "image:";
const COUNTER_PREFIX: &str = "count:";
const LOCK_PREFIX: &str = "lock:";
const GRAPH_PREFIX: &str = "graph:";
const FILTER_PREFIX: &str = "filter:";
const REFRESH_PREFIX: &str = "refreshing:";

/// A fully qualified key in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Canonical string form of a value used inside a cache key.
///
/// Implement this for domain identifiers instead of relying on generic
/// serialization, so the key shape is explicit at the type.
pub trait CacheKeyable: Sync {
    fn key_part(&self) -> Result<Cow<'_, str>, String>;
}

impl CacheKeyable for str {
    fn key_part(&self) -> Result<Cow<'_, str>, String> {
        Ok(Cow::Borrowed(self))
    }
}

impl CacheKeyable for String {
    fn key_part(&self) -> Result<Cow<'_, str>, String> {
        Ok(Cow::Borrowed(self.as_str()))
    }
}

impl<T: CacheKeyable + ?Sized> CacheKeyable for &T {
    fn key_part(&self) -> Result<Cow<'_, str>, String> {
        (**self).key_part()
    }
}

impl<T: CacheKeyable> CacheKeyable for Option<T> {
    fn key_part(&self) -> Result<Cow<'_, str>, String> {
        match self {
            Some(inner) => inner.key_part(),
            None => Ok(Cow::Borrowed("None")),
        }
    }
}

macro_rules! keyable_via_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheKeyable for $ty {
                fn key_part(&self) -> Result<Cow<'_, str>, String> {
                    Ok(Cow::Owned(self.to_string()))
                }
            }
        )*
    };
}

keyable_via_display!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char, f32, f64, Uuid
);

/// Key part encoded as JSON with sorted object keys.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(pub T);

impl<T: Serialize + Sync> CacheKeyable for Json<T> {
    fn key_part(&self) -> Result<Cow<'_, str>, String> {
        // `Value` keeps objects in a BTreeMap, which sorts their keys.
        let value = serde_json::to_value(&self.0).map_err(|err| err.to_string())?;
        let encoded = value.to_string();
        if encoded.len() > MAX_INLINE_PART {
            return Ok(Cow::Owned(sha256_hex(encoded.as_bytes())));
        }
        Ok(Cow::Owned(encoded))
    }
}

/// Key part replaced by the SHA-256 digest of its JSON encoding.
#[derive(Debug, Clone, Copy)]
pub struct Hashed<T>(pub T);

impl<T: Serialize + Sync> CacheKeyable for Hashed<T> {
    fn key_part(&self) -> Result<Cow<'_, str>, String> {
        let value = serde_json::to_value(&self.0).map_err(|err| err.to_string())?;
        Ok(Cow::Owned(sha256_hex(value.to_string().as_bytes())))
    }
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Build the namespace-free logical key `prefix:arg1:arg2…`.
pub fn logical_key(prefix: &str, args: &[&dyn CacheKeyable]) -> Result<String, CacheError> {
    let mut key = String::from(prefix);
    for (position, arg) in args.iter().enumerate() {
        let part = arg
            .key_part()
            .map_err(|reason| CacheError::key(prefix, format!("argument {position}: {reason}")))?;
        key.push(':');
        key.push_str(&part);
    }
    Ok(key)
}

/// Namespaced key layout shared by every component.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    namespace: Arc<str>,
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self::new("")
    }
}

impl KeyScheme {
    pub fn new(namespace: impl AsRef<str>) -> Self {
        Self {
            namespace: Arc::from(namespace.as_ref()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn compose(&self, category: &str, suffix: &str) -> CacheKey {
        let mut key = String::with_capacity(self.namespace.len() + category.len() + suffix.len());
        key.push_str(&self.namespace);
        key.push_str(category);
        key.push_str(suffix);
        CacheKey(key)
    }

    /// Record cache key for `prefix` and its call arguments.
    pub fn record(&self, prefix: &str, args: &[&dyn CacheKeyable]) -> Result<CacheKey, CacheError> {
        Ok(self.record_from_logical(&logical_key(prefix, args)?))
    }

    pub fn record_from_logical(&self, logical: &str) -> CacheKey {
        self.compose(RECORD_PREFIX, logical)
    }

    pub fn image(&self, category: &str, url_digest: &str) -> CacheKey {
        self.compose(IMAGE_PREFIX, &format!("{category}:{url_digest}"))
    }

    /// Key used before images were partitioned by category.
    pub fn legacy_image(&self, url_digest: &str) -> CacheKey {
        self.compose(IMAGE_PREFIX, url_digest)
    }

    /// Glob matching every image key, or only one category's keys.
    pub fn image_pattern(&self, category: Option<&str>) -> String {
        let mut pattern = escape_glob(&self.namespace);
        pattern.push_str(IMAGE_PREFIX);
        if let Some(category) = category {
            pattern.push_str(&escape_glob(category));
            pattern.push(':');
        }
        pattern.push('*');
        pattern
    }

    pub fn counter(
        &self,
        counter_type: &str,
        target_type: &str,
        target_id: &dyn fmt::Display,
    ) -> CacheKey {
        self.compose(
            COUNTER_PREFIX,
            &format!("{counter_type}:{target_type}:{target_id}"),
        )
    }

    pub fn lock(&self, name: &str) -> CacheKey {
        self.compose(LOCK_PREFIX, name)
    }

    /// Marker guarding a background refresh of `key`.
    pub fn refresh_marker(&self, key: &CacheKey) -> CacheKey {
        let suffix = key
            .as_str()
            .strip_prefix(self.namespace())
            .unwrap_or(key.as_str());
        self.compose(REFRESH_PREFIX, suffix)
    }

    pub fn filter(&self, name: &str) -> CacheKey {
        self.compose(FILTER_PREFIX, name)
    }

    pub fn graph_dependents(&self, depended_on: &str) -> CacheKey {
        self.compose(GRAPH_PREFIX, &format!("deps:{depended_on}"))
    }

    pub fn graph_group(&self, group: &str) -> CacheKey {
        self.compose(GRAPH_PREFIX, &format!("group:{group}"))
    }

    pub fn graph_groups_of(&self, key: &str) -> CacheKey {
        self.compose(GRAPH_PREFIX, &format!("groups-of:{key}"))
    }

    /// Caller-supplied glob confined to this namespace.
    pub fn scoped_pattern(&self, pattern: &str) -> String {
        format!("{}{pattern}", escape_glob(&self.namespace))
    }

    /// Glob over one family of graph index keys (`deps`, `group`, `groups-of`).
    pub fn graph_pattern(&self, family: &str) -> String {
        format!("{}{GRAPH_PREFIX}{family}:*", escape_glob(&self.namespace))
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
