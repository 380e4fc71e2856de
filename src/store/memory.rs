//! In-process [`KeyValueStore`] backed by a sharded map.
//!
//! Expiry is lazy and measured on the tokio clock, so paused-time tests can
//! advance TTLs deterministically. Memory accounting is the sum of key and
//! value lengths, which is enough to drive the governor.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{KeyTtl, KeyValueStore, MemoryInfo, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Bytes),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn size(&self) -> u64 {
        let len = match &self.value {
            Value::Bytes(bytes) => bytes.len(),
            Value::Set(members) => members.iter().map(String::len).sum(),
        };
        len as u64
    }
}

/// Single-process store with Redis-like semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    max_memory: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `max_bytes` as the memory ceiling from [`KeyValueStore::info_memory`].
    pub fn with_max_memory(max_bytes: u64) -> Self {
        Self {
            slots: DashMap::new(),
            max_memory: max_bytes,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_entry(&self, key: &str) -> Option<Slot> {
        let now = Instant::now();
        let slot = self.slots.get(key)?.clone();
        if slot.is_expired(now) {
            self.slots.remove_if(key, |_, slot| slot.is_expired(now));
            return None;
        }
        Some(slot)
    }

    fn occupied_live(entry: &Entry<'_, String, Slot>) -> bool {
        match entry {
            Entry::Occupied(occupied) => !occupied.get().is_expired(Instant::now()),
            Entry::Vacant(_) => false,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.live_entry(key) {
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(_) => Err(StoreError::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.slots
            .insert(key.to_string(), Slot::new(Value::Bytes(value), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| !slot.is_expired(now)))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .iter()
            .filter(|slot| !slot.is_expired(now) && glob_match(pattern, slot.key()))
            .map(|slot| slot.key().clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        Ok(match self.live_entry(key) {
            None => KeyTtl::Missing,
            Some(Slot {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let entry = self.slots.entry(key.to_string());
        if Self::occupied_live(&entry) {
            return Ok(false);
        }
        entry.insert(Slot::new(Value::Bytes(value), Some(ttl)));
        Ok(true)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let entry = self.slots.entry(key.to_string());
        let live = Self::occupied_live(&entry);
        match entry {
            Entry::Occupied(mut occupied) if live => {
                let slot = occupied.get_mut();
                let Value::Bytes(bytes) = &slot.value else {
                    return Err(StoreError::wrong_type(key));
                };
                let current = parse_integer(key, bytes)?;
                let next = current.checked_add(delta).ok_or_else(|| {
                    StoreError::command("INCRBY", "increment or decrement would overflow")
                })?;
                slot.value = Value::Bytes(Bytes::from(next.to_string()));
                Ok(next)
            }
            entry => {
                entry.insert(Slot::new(Value::Bytes(Bytes::from(delta.to_string())), None));
                Ok(delta)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_expiry(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let target = now + ttl;
        match self.slots.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                if slot.expires_at.is_some_and(|at| at >= target) {
                    return Ok(false);
                }
                slot.expires_at = Some(target);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = self.slots.remove_if(key, |_, slot| {
            !slot.is_expired(now)
                && matches!(&slot.value, Value::Bytes(bytes) if bytes.as_ref() == expected)
        });
        Ok(removed.is_some())
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot)
                if !slot.is_expired(now)
                    && matches!(&slot.value, Value::Bytes(bytes) if bytes.as_ref() == expected) =>
            {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn info_memory(&self) -> Result<MemoryInfo, StoreError> {
        let now = Instant::now();
        let used = self
            .slots
            .iter()
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.key().len() as u64 + slot.size())
            .sum();
        Ok(MemoryInfo {
            used,
            max: self.max_memory,
        })
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .live_entry(key)
            .map(|slot| key.len() as u64 + slot.size()))
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let entry = self.slots.entry(key.to_string());
        let live = Self::occupied_live(&entry);
        let mut slot = match entry {
            Entry::Occupied(occupied) if live => occupied.into_ref(),
            entry => entry.insert(Slot::new(Value::Set(HashSet::new()), None)),
        };
        let Value::Set(set) = &mut slot.value else {
            return Err(StoreError::wrong_type(key));
        };
        let added = members
            .iter()
            .filter(|member| set.insert((*member).clone()))
            .count();
        Ok(added as u64)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(0);
        };
        if slot.is_expired(now) {
            return Ok(0);
        }
        let Value::Set(set) = &mut slot.value else {
            return Err(StoreError::wrong_type(key));
        };
        let removed = members.iter().filter(|member| set.remove(*member)).count();
        let now_empty = set.is_empty();
        drop(slot);
        if now_empty {
            self.slots
                .remove_if(key, |_, slot| matches!(&slot.value, Value::Set(set) if set.is_empty()));
        }
        Ok(removed as u64)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.live_entry(key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.into_iter().collect()),
            Some(_) => Err(StoreError::wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn take_set(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let removed = self.slots.remove_if(key, |_, slot| {
            slot.is_expired(now) || matches!(slot.value, Value::Set(_))
        });
        let Some((_, slot)) = removed else {
            return if self.slots.contains_key(key) {
                Err(StoreError::wrong_type(key))
            } else {
                Ok(Vec::new())
            };
        };
        let expired = slot.is_expired(now);
        match slot.value {
            Value::Set(set) if !expired => Ok(set.into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        match self.live_entry(key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(_) => Err(StoreError::wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        match self.live_entry(key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(StoreError::wrong_type(key)),
            None => Ok(0),
        }
    }
}

fn parse_integer(key: &str, bytes: &Bytes) -> Result<i64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| StoreError::command("INCRBY", format!("value at `{key}` is not an integer")))
}

/// Redis-style glob matching supporting `*`, `?`, `[...]` and `\` escapes.
///
/// Runs in `O(pattern × text)`: a mismatch after `*` resumes from the most
/// recent star instead of recursing into every split.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let tokens = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut last_star: Option<(usize, usize)> = None;
    while t < text.len() {
        match tokens.get(p) {
            Some(GlobToken::Star) => {
                last_star = Some((p, t));
                p += 1;
            }
            Some(token) if token.matches(text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match last_star {
                Some((star, consumed)) => {
                    last_star = Some((star, consumed + 1));
                    p = star + 1;
                    t = consumed + 1;
                }
                None => return false,
            },
        }
    }
    tokens[p..]
        .iter()
        .all(|token| matches!(token, GlobToken::Star))
}

#[derive(Debug, PartialEq)]
enum GlobToken {
    Star,
    Any,
    Literal(char),
    Class {
        negated: bool,
        members: Vec<char>,
    },
}

impl GlobToken {
    fn matches(&self, candidate: char) -> bool {
        match self {
            Self::Star | Self::Any => true,
            Self::Literal(literal) => *literal == candidate,
            Self::Class { negated, members } => class_contains(members, candidate) != *negated,
        }
    }
}

fn class_contains(members: &[char], candidate: char) -> bool {
    let mut idx = 0;
    while idx < members.len() {
        if idx + 2 < members.len() && members[idx + 1] == '-' {
            if members[idx] <= candidate && candidate <= members[idx + 2] {
                return true;
            }
            idx += 3;
        } else {
            if members[idx] == candidate {
                return true;
            }
            idx += 1;
        }
    }
    false
}

fn tokenize(pattern: &str) -> Vec<GlobToken> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut idx = 0;
    while idx < chars.len() {
        let token = match chars[idx] {
            '*' => GlobToken::Star,
            '?' => GlobToken::Any,
            '\\' if idx + 1 < chars.len() => {
                idx += 1;
                GlobToken::Literal(chars[idx])
            }
            '[' => match chars[idx + 1..].iter().position(|&c| c == ']') {
                Some(close) => {
                    let class = &chars[idx + 1..idx + 1 + close];
                    idx += close + 1;
                    match class.split_first() {
                        Some((&'^', tail)) => GlobToken::Class {
                            negated: true,
                            members: tail.to_vec(),
                        },
                        _ => GlobToken::Class {
                            negated: false,
                            members: class.to_vec(),
                        },
                    }
                }
                None => GlobToken::Literal('['),
            },
            literal => GlobToken::Literal(literal),
        };
        tokens.push(token);
        idx += 1;
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("image:*", "image:article:abc"));
        assert!(glob_match("data:post:?", "data:post:7"));
        assert!(!glob_match("data:post:?", "data:post:17"));
        assert!(glob_match("count:[lv]*", "count:likes:article:1"));
        assert!(!glob_match("count:[^lv]*", "count:likes:article:1"));
        assert!(glob_match(r"lock:\*", "lock:*"));
        assert!(!glob_match("image:*", "data:image:1"));
        assert!(glob_match("*", ""));
        assert!(glob_match("data:*:7", "data:post:comment:7"));
        assert!(glob_match("[abc", "[abc"));
    }

    #[test]
    fn glob_star_runs_stay_linear() {
        let pattern = format!("{}b", "a*".repeat(40));
        let text = "a".repeat(200);
        assert!(!glob_match(&pattern, &text));
        assert!(glob_match(&pattern, &format!("{text}b")));
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_on_the_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(1)))
            .await
            .expect("set");
        assert!(store.get("k").await.expect("get").is_some());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.get("k").await.expect("get").is_none());
        assert_eq!(store.ttl("k").await.expect("ttl"), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn set_if_not_exists_is_exclusive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.set_if_not_exists("k", Bytes::from_static(b"a"), ttl).await.expect("nx"));
        assert!(!store.set_if_not_exists("k", Bytes::from_static(b"b"), ttl).await.expect("nx"));
        assert_eq!(store.get("k").await.expect("get"), Some(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn increment_initializes_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("n", 3).await.expect("incr"), 3);
        assert_eq!(store.increment("n", -1).await.expect("incr"), 2);

        store
            .set("text", Bytes::from_static(b"abc"), None)
            .await
            .expect("set");
        assert!(store.increment("text", 1).await.is_err());
    }

    #[tokio::test]
    async fn compare_and_delete_respects_owner() {
        let store = MemoryStore::new();
        store
            .set("lock", Bytes::from_static(b"owner"), None)
            .await
            .expect("set");
        assert!(!store.delete_if_equals("lock", b"other").await.expect("cad"));
        assert!(store.delete_if_equals("lock", b"owner").await.expect("cad"));
        assert!(store.get("lock").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn sets_track_members_and_types() {
        let store = MemoryStore::new();
        let members = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(store.set_add("s", &members).await.expect("sadd"), 2);
        assert!(store.set_contains("s", "a").await.expect("sismember"));
        assert_eq!(store.set_len("s").await.expect("scard"), 2);
        assert!(store.get("s").await.is_err());

        store
            .set_remove("s", &["a".to_string(), "b".to_string()])
            .await
            .expect("srem");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn take_set_drains_members_once() {
        let store = MemoryStore::new();
        store
            .set_add("s", &["a".to_string(), "b".to_string()])
            .await
            .expect("sadd");
        let mut taken = store.take_set("s").await.expect("take");
        taken.sort();
        assert_eq!(taken, vec!["a", "b"]);
        assert!(store.take_set("s").await.expect("take").is_empty());

        store
            .set("v", Bytes::from_static(b"x"), None)
            .await
            .expect("set");
        assert!(store.take_set("v").await.is_err());
        assert!(store.get("v").await.expect("get").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_expiry_never_shortens() {
        let store = MemoryStore::new();
        store.set_add("s", &["a".to_string()]).await.expect("sadd");
        let minute = Duration::from_secs(60);

        assert!(store.extend_expiry("s", minute).await.expect("extend"));
        assert!(!store.extend_expiry("s", Duration::from_secs(10)).await.expect("extend"));
        assert_eq!(store.ttl("s").await.expect("ttl"), KeyTtl::Expires(minute));
        assert!(!store.extend_expiry("absent", minute).await.expect("extend"));
    }

    #[tokio::test]
    async fn memory_info_sums_keys_and_values() {
        let store = MemoryStore::with_max_memory(1_000);
        store
            .set("abc", Bytes::from(vec![0_u8; 97]), None)
            .await
            .expect("set");
        let info = store.info_memory().await.expect("info");
        assert_eq!(info, MemoryInfo { used: 100, max: 1_000 });
        assert_eq!(store.memory_usage("abc").await.expect("usage"), Some(100));
    }
}
