//! Remote cache stores
//!
//! The cache manager needs only a small operation set from the shared store:
//! GET, SETEX, DEL, KEYS, SADD, SMEMBERS, EXPIRE plus a ping and one-time
//! configuration. [`RedisStore`] implements it over a `bb8` pool of Redis
//! connections; [`MemoryStore`] keeps everything in process and can simulate
//! an outage.

use crate::cache::glob_to_regex;
use crate::error::{sanitize, Result, TenantForgeError};
use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands};
use bb8_redis::{bb8, RedisConnectionManager};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Minimal shared key/value store contract
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Apply the memory policy and enable expiry notifications
    async fn configure(&self, max_memory_policy: &str) -> Result<()>;
}

fn unavailable(error: impl std::fmt::Display) -> TenantForgeError {
    TenantForgeError::CacheUnavailable(sanitize(&error.to_string()))
}

/// Redis-backed store
pub struct RedisStore {
    pool: bb8::Pool<RedisConnectionManager>,
}

impl RedisStore {
    /// Build the connection pool without dialing; connections open on use
    pub fn connect(url: &str, max_size: u32) -> Result<Self> {
        let manager = RedisConnectionManager::new(url).map_err(unavailable)?;
        let pool = bb8::Pool::builder()
            .max_size(max_size.max(1))
            .connection_timeout(Duration::from_secs(2))
            .build_unchecked(manager);
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool.get().await.map_err(unavailable)
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(unavailable)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(key, value, ttl_secs.max(1))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(keys.to_vec()).await.map_err(unavailable)?;
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys(pattern).await.map_err(unavailable)?;
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(key, member).await.map_err(unavailable)?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn.smembers(key).await.map_err(unavailable)?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .expire(key, ttl_secs.max(1) as i64)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn configure(&self, max_memory_policy: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory-policy")
            .arg(max_memory_policy)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Stored<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Stored<T> {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-process store with the same semantics as the remote one.
///
/// Used when no remote URL is configured and in tests; `set_available(false)`
/// makes every operation fail with `CacheUnavailable`.
#[derive(Debug)]
pub struct MemoryStore {
    values: DashMap<String, Stored<Vec<u8>>>,
    sets: DashMap<String, Stored<HashSet<String>>>,
    available: AtomicBool,
    policy: std::sync::Mutex<Option<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            available: AtomicBool::new(true),
            policy: std::sync::Mutex::new(None),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live string keys
    pub fn len(&self) -> usize {
        self.values.iter().filter(|e| e.value().is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory policy recorded by `configure`
    pub fn memory_policy(&self) -> Option<String> {
        self.policy.lock().ok().and_then(|p| p.clone())
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TenantForgeError::CacheUnavailable("store offline".to_string()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let live = self.values.get(key).filter(|e| e.is_live()).map(|e| e.value.clone());
        if live.is_none() {
            self.values.remove_if(key, |_, e| !e.is_live());
        }
        Ok(live)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.check()?;
        self.values.insert(
            key.to_string(),
            Stored {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs.max(1))),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        let mut removed = 0;
        for key in keys {
            let value = self.values.remove(key).filter(|(_, e)| e.is_live());
            let set = self.sets.remove(key).filter(|(_, e)| e.is_live());
            if value.is_some() || set.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let matcher = glob_to_regex(pattern)?;
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.value().is_live() && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .chain(
                self.sets
                    .iter()
                    .filter(|e| e.value().is_live() && matcher.is_match(e.key()))
                    .map(|e| e.key().clone()),
            )
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        let mut entry = self.sets.entry(key.to_string()).or_insert_with(|| Stored {
            value: HashSet::new(),
            expires_at: None,
        });
        if !entry.is_live() {
            entry.value.clear();
            entry.expires_at = None;
        }
        entry.value.insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut members: Vec<String> = self
            .sets
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.check()?;
        let at = Some(Instant::now() + Duration::from_secs(ttl_secs.max(1)));
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.expires_at = at;
        }
        if let Some(mut entry) = self.sets.get_mut(key) {
            entry.expires_at = at;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn configure(&self, max_memory_policy: &str) -> Result<()> {
        self.check()?;
        if let Ok(mut policy) = self.policy.lock() {
            *policy = Some(max_memory_policy.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic_ops() {
        let store = MemoryStore::new();
        store.set_ex("tf:a", b"1".to_vec(), 60).await.unwrap();
        store.set_ex("tf:b", b"2".to_vec(), 60).await.unwrap();

        assert_eq!(store.get("tf:a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.keys("tf:*").await.unwrap(), vec!["tf:a", "tf:b"]);
        assert_eq!(store.del(&["tf:a".to_string()]).await.unwrap(), 1);
        assert_eq!(store.get("tf:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_sets() {
        let store = MemoryStore::new();
        store.sadd("tf:tag:x", "tf:a").await.unwrap();
        store.sadd("tf:tag:x", "tf:b").await.unwrap();
        assert_eq!(store.smembers("tf:tag:x").await.unwrap(), vec!["tf:a", "tf:b"]);

        store.del(&["tf:tag:x".to_string()]).await.unwrap();
        assert!(store.smembers("tf:tag:x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_outage() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(TenantForgeError::CacheUnavailable(_))
        ));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_records_policy() {
        let store = MemoryStore::new();
        store.configure("allkeys-lru").await.unwrap();
        assert_eq!(store.memory_policy().as_deref(), Some("allkeys-lru"));
    }
}
