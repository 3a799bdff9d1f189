//! `KV`: the shared Redis-compatible store collaborator used for inflight
//! tracking and GC locking. Only the narrow command set the registry needs
//! is exposed — `SET NX EX`, `GET`, a value-checked `DEL` (WATCH/MULTI/EXEC),
//! the sorted-set ops, and the hash ops — rather than the whole client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use redis::AsyncCommands;

const KV_TIMEOUT_MILLIS: u64 = 250;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("kv command timed out")]
    Timeout,
    #[error("kv command failed: {0}")]
    Command(#[from] redis::RedisError),
}

#[async_trait::async_trait]
pub trait Kv: Send + Sync {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    /// Delete `key` only if its current value equals `expected`. Implements
    /// the WATCH/GET/MULTI/DEL/EXEC pattern in place of server-side
    /// scripting.
    async fn delete_if_value_eq(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), KvError>;
    /// Refresh the scores of many members in one batch (heartbeat update).
    async fn zadd_many(&self, key: &str, entries: &[(String, i64)]) -> Result<(), KvError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError>;
    async fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>, KvError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
}

/// The real Redis-backed `KV`, wrapping `redis::Client` with a per-command
/// timeout.
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn new(addr: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(addr)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::Connection, KvError> {
        Ok(self.client.get_async_connection().await?)
    }
}

async fn with_timeout<T>(fut: impl std::future::Future<Output = redis::RedisResult<T>>) -> Result<T, KvError> {
    match tokio::time::timeout(Duration::from_millis(KV_TIMEOUT_MILLIS), fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(KvError::Timeout),
    }
}

#[async_trait::async_trait]
impl Kv for RedisKv {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs().max(1) as usize));
        let result: Option<String> = with_timeout(conn.set_options(key, value, opts)).await?;
        Ok(result.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(with_timeout(conn.get(key)).await?)
    }

    async fn delete_if_value_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        // WATCH/GET/MULTI/DEL/EXEC without server-side scripting (distilled
        // spec §9 explicitly rules out Lua): if the value changed between
        // GET and EXEC, the transaction aborts and the outer `MULTI` yields
        // `None`, which reads as "not deleted".
        let _: () = with_timeout(redis::cmd("WATCH").arg(key).query_async(&mut conn)).await?;

        let current: Option<String> = with_timeout(conn.get(key)).await?;
        if current.as_deref() != Some(expected) {
            let _: () = with_timeout(redis::cmd("UNWATCH").query_async(&mut conn)).await?;
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic().del(key);
        let result: Option<(i64,)> = with_timeout(pipe.query_async(&mut conn)).await?;
        Ok(result.is_some())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = with_timeout(conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn zadd_many(&self, key: &str, entries: &[(String, i64)]) -> Result<(), KvError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let items: Vec<(i64, String)> = entries.iter().map(|(m, s)| (*s, m.clone())).collect();
        let _: () = with_timeout(conn.zadd_multiple(key, &items)).await?;
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError> {
        let mut conn = self.conn().await?;
        Ok(with_timeout(conn.zscore(key, member)).await?)
    }

    async fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(with_timeout(conn.zrangebyscore(key, min, max)).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = with_timeout(conn.zrem(key, member)).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = with_timeout(conn.hset(key, field, value)).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(with_timeout(conn.hget(key, field)).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = with_timeout(conn.hdel(key, field)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = with_timeout(conn.expire(key, ttl.as_secs().max(1) as usize)).await?;
        Ok(())
    }
}

/// An in-memory `Kv` fake, faithful enough to the real semantics (including
/// the NX-set and value-checked delete) to drive registry/GC unit tests
/// without a Redis instance.
#[derive(Default)]
pub struct FakeKv {
    strings: Mutex<HashMap<String, String>>,
    zsets: Mutex<HashMap<String, BTreeMap<String, i64>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl FakeKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Kv for FakeKv {
    async fn set_nx_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool, KvError> {
        let mut strings = self.strings.lock().expect("poisoned mutex");
        if strings.contains_key(key) {
            Ok(false)
        } else {
            strings.insert(key.to_owned(), value.to_owned());
            Ok(true)
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.strings.lock().expect("poisoned mutex").get(key).cloned())
    }

    async fn delete_if_value_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut strings = self.strings.lock().expect("poisoned mutex");
        if strings.get(key).map(|v| v.as_str()) == Some(expected) {
            strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), KvError> {
        self.zsets
            .lock()
            .expect("poisoned mutex")
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn zadd_many(&self, key: &str, entries: &[(String, i64)]) -> Result<(), KvError> {
        let mut zsets = self.zsets.lock().expect("poisoned mutex");
        let set = zsets.entry(key.to_owned()).or_default();
        for (member, score) in entries {
            set.insert(member.clone(), *score);
        }
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>, KvError> {
        Ok(self
            .zsets
            .lock()
            .expect("poisoned mutex")
            .get(key)
            .and_then(|set| set.get(member))
            .copied())
    }

    async fn zrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>, KvError> {
        Ok(self
            .zsets
            .lock()
            .expect("poisoned mutex")
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(set) = self.zsets.lock().expect("poisoned mutex").get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.hashes
            .lock()
            .expect("poisoned mutex")
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .hashes
            .lock()
            .expect("poisoned mutex")
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        if let Some(h) = self.hashes.lock().expect("poisoned mutex").get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), KvError> {
        // The fake never expires keys; TTL behavior is only exercised
        // against real Redis in integration tests gated behind a running
        // instance.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_ex_only_succeeds_once() {
        let kv = FakeKv::new();
        assert!(kv.set_nx_ex("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!kv.set_nx_ex("lock", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_value_eq_is_value_checked() {
        let kv = FakeKv::new();
        kv.set_nx_ex("lock", "token-a", Duration::from_secs(1)).await.unwrap();
        assert!(!kv.delete_if_value_eq("lock", "token-b").await.unwrap());
        assert!(kv.get("lock").await.unwrap().is_some());
        assert!(kv.delete_if_value_eq("lock", "token-a").await.unwrap());
        assert!(kv.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zrangebyscore_filters_by_score() {
        let kv = FakeKv::new();
        kv.zadd("idx", "a", 100).await.unwrap();
        kv.zadd("idx", "b", 200).await.unwrap();
        kv.zadd("idx", "c", 300).await.unwrap();
        let members = kv.zrangebyscore("idx", i64::MIN, 200).await.unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn zadd_many_refreshes_scores_in_one_batch() {
        let kv = FakeKv::new();
        kv.zadd("idx", "a", 1).await.unwrap();
        kv.zadd("idx", "b", 2).await.unwrap();
        kv.zadd_many("idx", &[("a".into(), 500), ("b".into(), 500)]).await.unwrap();
        assert_eq!(kv.zscore("idx", "a").await.unwrap(), Some(500));
        assert_eq!(kv.zscore("idx", "b").await.unwrap(), Some(500));
    }
}
