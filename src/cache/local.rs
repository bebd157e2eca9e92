//! In-process cache level
//!
//! A sharded concurrent map; callers never contend on one global lock.
//! TTL expiry is checked lazily on read, and once the map grows past its
//! capacity the oldest entries (by creation time) are evicted regardless of
//! their TTL.

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// A cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub ttl: Duration,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub module: Option<String>,
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: Duration,
        module: Option<String>,
        tags: Vec<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            ttl,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            module,
            tags,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Local entry summary for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct LocalEntryInfo {
    pub key: String,
    pub module: Option<String>,
    pub access_count: u64,
    pub age_ms: u64,
}

#[derive(Debug)]
pub struct LocalCache {
    capacity: usize,
    entries: DashMap<String, CacheEntry>,
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
        }
    }

    /// Live value for `key`; an expired entry is removed and reported as a miss
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let value = {
            let mut entry = self.entries.get_mut(key)?;
            if entry.is_expired() {
                None
            } else {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                Some(entry.value.clone())
            }
        };

        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        value
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
        self.evict_overflow();
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching `matcher`
    pub fn remove_matching(&self, matcher: &Regex) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !matcher.is_match(key));
        before.saturating_sub(self.entries.len())
    }

    /// Remove every entry carrying `tag`
    pub fn remove_tagged(&self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Snapshot of current entries, most accessed first
    pub fn entries(&self) -> Vec<LocalEntryInfo> {
        let mut infos: Vec<LocalEntryInfo> = self
            .entries
            .iter()
            .map(|e| LocalEntryInfo {
                key: e.key().clone(),
                module: e.module.clone(),
                access_count: e.access_count,
                age_ms: e.created_at.elapsed().as_millis() as u64,
            })
            .collect();
        infos.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        infos
    }

    fn evict_overflow(&self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.created_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, ttl: Duration, tags: &[&str]) -> CacheEntry {
        CacheEntry::new(
            key,
            json!({"key": key}),
            ttl,
            Some("vendas".to_string()),
            tags.iter().map(|t| t.to_string()).collect(),
        )
    }

    #[test]
    fn test_get_counts_access() {
        let cache = LocalCache::new(10);
        cache.insert(entry("vendas:a", Duration::from_secs(60), &[]));
        assert!(cache.get("vendas:a").is_some());
        assert!(cache.get("vendas:a").is_some());
        assert_eq!(cache.entries()[0].access_count, 2);
    }

    #[test]
    fn test_expired_entry_is_evicted_on_read() {
        let cache = LocalCache::new(10);
        cache.insert(entry("vendas:a", Duration::ZERO, &[]));
        assert!(cache.get("vendas:a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = LocalCache::new(2);
        cache.insert(entry("a", Duration::from_secs(60), &[]));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(entry("b", Duration::from_secs(60), &[]));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(entry("c", Duration::from_secs(60), &[]));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_remove_tagged_leaves_untagged() {
        let cache = LocalCache::new(10);
        cache.insert(entry("a", Duration::from_secs(60), &["clientes"]));
        cache.insert(entry("b", Duration::from_secs(60), &["pedidos"]));
        cache.insert(entry("c", Duration::from_secs(60), &[]));

        assert_eq!(cache.remove_tagged("clientes"), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
