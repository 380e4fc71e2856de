//! Redis-backed [`KeyValueStore`].
//!
//! Uses a multiplexed `ConnectionManager` (reconnects on failure) and Lua
//! scripts for the owner-checked lock operations and set draining so the read
//! and the mutation happen atomically on the server.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use super::{KeyTtl, KeyValueStore, MemoryInfo, StoreError};

const SCAN_BATCH: usize = 500;

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const EXTEND_EXPIRY: &str = r#"
local remaining = redis.call("PTTL", KEYS[1])
if remaining == -2 then
    return 0
end
if remaining == -1 or remaining < tonumber(ARGV[1]) then
    return redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return 0
"#;

const TAKE_SET: &str = r#"
local members = redis.call("SMEMBERS", KEYS[1])
redis.call("DEL", KEYS[1])
return members
"#;

/// Store talking to a Redis-compatible server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    delete_if_equals: Script,
    expire_if_equals: Script,
    extend_expiry: Script,
    take_set: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url` (for example `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|err| StoreError::connection(err.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::connection(err.to_string()))?;
        debug!("connected to redis");
        Ok(Self {
            connection,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
            extend_expiry: Script::new(EXTEND_EXPIRY),
            take_set: Script::new(TAKE_SET),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn command_error(command: &'static str) -> impl FnOnce(redis::RedisError) -> StoreError {
    move |err| {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::connection(err.to_string())
        } else {
            StoreError::command(command, err.to_string())
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("GET"))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let () = cmd
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("DEL"))?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let mut removed = 0;
        for chunk in keys.chunks(SCAN_BATCH) {
            let count: u64 = redis::cmd("DEL")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(command_error("DEL"))?;
            removed += count;
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(command_error("SCAN"))?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let mut conn = self.conn();
        let remaining: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("PTTL"))?;
        Ok(match remaining {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0).unsigned_abs())),
        })
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(command_error("INCRBY"))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error("PEXPIRE"))?;
        Ok(updated == 1)
    }

    async fn extend_expiry(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let updated: i64 = self
            .extend_expiry
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA extend_expiry"))?;
        Ok(updated == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA delete_if_equals"))?;
        Ok(removed == 1)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let updated: i64 = self
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA expire_if_equals"))?;
        Ok(updated == 1)
    }

    async fn info_memory(&self) -> Result<MemoryInfo, StoreError> {
        let mut conn = self.conn();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(command_error("INFO"))?;
        parse_memory_info(&info)
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn();
        redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("MEMORY USAGE"))
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SADD"))
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SREM"))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SMEMBERS"))
    }

    async fn take_set(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        self.take_set
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA take_set"))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let present: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SISMEMBER"))?;
        Ok(present == 1)
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        redis::cmd("SCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error("SCARD"))
    }
}

/// Extract `used_memory` and `maxmemory` from an `INFO memory` reply.
fn parse_memory_info(info: &str) -> Result<MemoryInfo, StoreError> {
    let mut used = None;
    let mut max = None;
    for line in info.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        match field {
            "used_memory" => used = value.trim().parse::<u64>().ok(),
            "maxmemory" => max = value.trim().parse::<u64>().ok(),
            _ => {}
        }
    }
    match used {
        Some(used) => Ok(MemoryInfo {
            used,
            max: max.unwrap_or(0),
        }),
        None => Err(StoreError::decode("INFO memory reply lacks used_memory")),
    }
}
