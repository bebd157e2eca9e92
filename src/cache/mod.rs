//! Cache Manager
//!
//! Two-level key/value cache: an in-process [`LocalCache`] in front of a
//! shared [`RemoteStore`]. Per-module and per-table [`CacheStrategy`]s decide
//! TTLs and levels. Entries can be invalidated by key, glob pattern, tag or
//! module, and every invalidation is published on the platform event bus.
//!
//! The remote store is never allowed to fail a caller: while it is
//! unreachable, reads are misses and writes are dropped.

pub mod local;
pub mod store;
pub mod strategy;

pub use local::{CacheEntry, LocalCache, LocalEntryInfo};
pub use store::{MemoryStore, RedisStore, RemoteStore};
pub use strategy::{CacheLevel, CacheStrategy, InvalidationMode, StrategyTable};

use crate::config::CacheSettings;
use crate::error::{Result, TenantForgeError};
use crate::events::{EventBus, InvalidationEvent, InvalidationKind, PlatformEvent};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HEADER_JSON: u8 = b'j';
const HEADER_GZIP: u8 = b'z';

/// Translate a glob (`*`, `?`) into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| TenantForgeError::InvalidInput(format!("invalid pattern {:?}: {}", pattern, e)))
}

/// Options for [`CacheManager::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the strategy TTL
    pub ttl: Option<Duration>,
    pub module: Option<String>,
    /// Selects a table strategy
    pub table: Option<String>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Default::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Counters reported by [`CacheManager::stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub remote_errors: u64,
    pub local_entries: usize,
    pub remote_connected: bool,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    remote_errors: AtomicU64,
}

/// Multi-level cache with strategy-driven placement and invalidation
pub struct CacheManager {
    settings: CacheSettings,
    local: LocalCache,
    remote: Arc<dyn RemoteStore>,
    connected: AtomicBool,
    strategies: StrategyTable,
    counters: Counters,
    events: EventBus,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new(settings: CacheSettings, remote: Arc<dyn RemoteStore>, events: EventBus) -> Self {
        Self {
            local: LocalCache::new(settings.local_capacity),
            strategies: StrategyTable::new(settings.default_ttl_secs),
            settings,
            remote,
            connected: AtomicBool::new(true),
            counters: Counters::default(),
            events,
            health_task: Mutex::new(None),
        }
    }

    /// Build a manager from settings: Redis when `url` is set, the
    /// in-process store otherwise. Never fails on an unreachable server.
    pub async fn connect(settings: CacheSettings, events: EventBus) -> Result<Self> {
        let remote: Arc<dyn RemoteStore> = match settings.url.as_deref() {
            Some(url) => Arc::new(RedisStore::connect(url, 16)?),
            None => Arc::new(MemoryStore::new()),
        };
        let manager = Self::new(settings, remote, events);
        manager.initialize().await;
        Ok(manager)
    }

    /// One-time store configuration. Failures only degrade the connectivity flag.
    pub async fn initialize(&self) {
        match self.remote.configure(&self.settings.max_memory_policy).await {
            Ok(()) => info!(policy = %self.settings.max_memory_policy, "cache store configured"),
            Err(e) => warn!(error = %e, "cache store configuration skipped"),
        }
        self.ping().await;
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Register or replace a strategy
    pub fn set_strategy(&self, strategy: CacheStrategy) {
        self.strategies.insert(strategy);
    }

    /// Effective strategy for `(module, table)`
    pub fn strategy_for(&self, module: Option<&str>, table: Option<&str>) -> CacheStrategy {
        self.strategies.resolve(module, table)
    }

    /// Forget every strategy of a module
    pub fn drop_strategies(&self, module: &str) {
        self.strategies.remove_module(module);
    }

    /// Whether the remote store is currently considered reachable
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Probe the remote store and update the connectivity flag
    pub async fn ping(&self) -> bool {
        match self.remote.ping().await {
            Ok(()) => {
                self.mark_connected();
                true
            }
            Err(e) => {
                self.mark_disconnected(&e);
                false
            }
        }
    }

    /// Read a value, local level first when the module strategy allows it
    pub async fn get<T: DeserializeOwned>(&self, key: &str, module: Option<&str>) -> Option<T> {
        self.get_for_table(key, module, None).await
    }

    /// Read a value under the strategy of `(module, table)`
    pub async fn get_for_table<T: DeserializeOwned>(
        &self,
        key: &str,
        module: Option<&str>,
        table: Option<&str>,
    ) -> Option<T> {
        let value = self.get_value(key, module, table).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                debug!(key, error = %e, "cached value has an unexpected shape");
                None
            }
        }
    }

    async fn get_value(&self, key: &str, module: Option<&str>, table: Option<&str>) -> Option<serde_json::Value> {
        let strategy = self.strategies.resolve(module, table);

        if strategy.level.uses_local() {
            if let Some(value) = self.local.get(key) {
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        if strategy.level.uses_remote() && self.is_connected() {
            match self.remote.get(&self.remote_key(key)).await {
                Ok(Some(bytes)) => match decode(&bytes) {
                    Ok(value) => {
                        self.mark_connected();
                        self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                        if strategy.level == CacheLevel::Both {
                            self.local.insert(CacheEntry::new(
                                key,
                                value.clone(),
                                Duration::from_secs(strategy.ttl_secs),
                                module.map(str::to_string),
                                strategy.tags.clone(),
                            ));
                        }
                        return Some(value);
                    }
                    Err(e) => debug!(key, error = %e, "undecodable remote cache value"),
                },
                Ok(None) => self.mark_connected(),
                Err(e) => self.mark_disconnected(&e),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value under the resolved strategy.
    ///
    /// Only a value that cannot be serialized is an error; remote store
    /// failures are swallowed.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let strategy = self
            .strategies
            .resolve(options.module.as_deref(), options.table.as_deref());
        let ttl = options
            .ttl
            .unwrap_or_else(|| Duration::from_secs(strategy.ttl_secs));

        let mut tags = options.tags;
        for tag in strategy.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        if strategy.level.uses_remote() && self.is_connected() {
            let bytes = encode(&value, self.settings.compression_threshold)?;
            if let Err(e) = self.write_remote(key, bytes, ttl, &tags).await {
                self.mark_disconnected(&e);
            } else {
                self.mark_connected();
            }
        }

        if strategy.level.uses_local() {
            self.local
                .insert(CacheEntry::new(key, value, ttl, options.module, tags));
        }
        Ok(())
    }

    async fn write_remote(&self, key: &str, bytes: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<()> {
        let remote_key = self.remote_key(key);
        let ttl_secs = ttl.as_secs().max(1);
        self.remote.set_ex(&remote_key, bytes, ttl_secs).await?;

        for tag in tags {
            let tag_key = self.tag_key(tag);
            self.remote.sadd(&tag_key, &remote_key).await?;
            self.remote.expire(&tag_key, ttl_secs.max(self.settings.default_ttl_secs)).await?;
        }
        Ok(())
    }

    /// Read-through: return the cached value unless `refresh`, otherwise run
    /// `load`, cache its result and return it
    pub async fn cache_query<T, F, Fut>(&self, key: &str, options: SetOptions, refresh: bool, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !refresh {
            let cached = self
                .get_for_table::<T>(key, options.module.as_deref(), options.table.as_deref())
                .await;
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }

        let fresh = load().await?;
        self.set(key, &fresh, options).await?;
        Ok(fresh)
    }

    /// Remove one key from both levels
    pub async fn invalidate(&self, key: &str, reason: &str) -> usize {
        let mut removed = usize::from(self.local.remove(key));
        if self.is_connected() {
            match self.remote.del(&[self.remote_key(key)]).await {
                Ok(n) => removed = removed.max(n as usize),
                Err(e) => self.mark_disconnected(&e),
            }
        }
        self.publish(InvalidationKind::Key, key, None, reason);
        removed
    }

    /// Remove every key matching a glob pattern
    pub async fn invalidate_pattern(&self, pattern: &str, module: Option<&str>, reason: &str) -> Result<usize> {
        let matcher = glob_to_regex(pattern)?;
        let mut removed = self.local.remove_matching(&matcher);

        if self.is_connected() {
            let scanned = self.remote.keys(&self.remote_key(pattern)).await;
            match scanned {
                Ok(keys) => match self.remote.del(&keys).await {
                    Ok(n) => removed = removed.max(n as usize),
                    Err(e) => self.mark_disconnected(&e),
                },
                Err(e) => self.mark_disconnected(&e),
            }
        }

        self.publish(InvalidationKind::Pattern, pattern, module, reason);
        Ok(removed)
    }

    /// Remove every entry set with `tag`, then the tag set itself
    pub async fn invalidate_tag(&self, tag: &str, reason: &str) -> usize {
        let mut removed = self.local.remove_tagged(tag);

        if self.is_connected() {
            let tag_key = self.tag_key(tag);
            match self.remote.smembers(&tag_key).await {
                Ok(members) => {
                    for member in &members {
                        if let Some(local_key) = member.strip_prefix(&self.settings.key_prefix) {
                            self.local.remove(local_key);
                        }
                    }
                    let mut doomed = members;
                    let member_count = doomed.len();
                    doomed.push(tag_key);
                    match self.remote.del(&doomed).await {
                        Ok(_) => removed = removed.max(member_count),
                        Err(e) => self.mark_disconnected(&e),
                    }
                }
                Err(e) => self.mark_disconnected(&e),
            }
        }

        self.publish(InvalidationKind::Tag, tag, None, reason);
        removed
    }

    /// Remove everything cached for a module (`<module>:*`)
    pub async fn invalidate_module(&self, module: &str, reason: &str) -> Result<usize> {
        let pattern = format!("{}:*", module);
        let matcher = glob_to_regex(&pattern)?;
        let mut removed = self.local.remove_matching(&matcher);

        if self.is_connected() {
            match self.remote.keys(&self.remote_key(&pattern)).await {
                Ok(keys) => match self.remote.del(&keys).await {
                    Ok(n) => removed = removed.max(n as usize),
                    Err(e) => self.mark_disconnected(&e),
                },
                Err(e) => self.mark_disconnected(&e),
            }
        }

        self.publish(InvalidationKind::Module, module, Some(module), reason);
        Ok(removed)
    }

    /// Local entry snapshot
    pub fn local_entries(&self) -> Vec<LocalEntryInfo> {
        self.local.entries()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            remote_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
            local_entries: self.local.len(),
            remote_connected: self.is_connected(),
        }
    }

    /// Ping the remote store periodically so a lost connection is noticed and
    /// a recovered one is put back into use
    pub fn start_health_checks(self: &Arc<Self>, period: Duration) {
        let Ok(mut slot) = self.health_task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.ping().await;
            }
        }));
    }

    /// Stop the health task
    pub fn shutdown(&self) {
        let task = self.health_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
        }
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.settings.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.settings.key_prefix, tag)
    }

    fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("cache store reachable again");
        }
    }

    fn mark_disconnected(&self, error: &TenantForgeError) {
        self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(error = %error, "cache store unavailable, serving from local level only");
        }
    }

    fn publish(&self, kind: InvalidationKind, target: &str, module: Option<&str>, reason: &str) {
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.events.emit(PlatformEvent::CacheInvalidated(InvalidationEvent {
            kind,
            target: target.to_string(),
            module: module.map(str::to_string),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }));
    }
}

fn encode(value: &serde_json::Value, threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if json.len() <= threshold {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(HEADER_JSON);
        out.extend_from_slice(&json);
        return Ok(out);
    }

    let mut encoder = GzEncoder::new(vec![HEADER_GZIP], Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decode(bytes: &[u8]) -> Result<serde_json::Value> {
    match bytes.split_first() {
        Some((&HEADER_JSON, body)) => Ok(serde_json::from_slice(body)?),
        Some((&HEADER_GZIP, body)) => {
            let mut json = Vec::new();
            GzDecoder::new(body).read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        }
        _ => Err(TenantForgeError::InvalidInput(
            "cache payload has no encoding header".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_with(store: Arc<MemoryStore>) -> CacheManager {
        CacheManager::new(CacheSettings::default(), store, EventBus::default())
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("vendas:*").unwrap();
        assert!(re.is_match("vendas:query:abc"));
        assert!(!re.is_match("estoque:query:abc"));

        let dotted = glob_to_regex("a.b?").unwrap();
        assert!(dotted.is_match("a.bc"));
        assert!(!dotted.is_match("axbc"));
    }

    #[test]
    fn test_encode_compresses_large_payloads() {
        let small = json!({"a": 1});
        let encoded = encode(&small, 1024).unwrap();
        assert_eq!(encoded[0], HEADER_JSON);
        assert_eq!(decode(&encoded).unwrap(), small);

        let large = json!({"blob": "x".repeat(5000)});
        let encoded = encode(&large, 1024).unwrap();
        assert_eq!(encoded[0], HEADER_GZIP);
        assert!(encoded.len() < 5000);
        assert_eq!(decode(&encoded).unwrap(), large);
    }

    #[tokio::test]
    async fn test_set_and_get_both_levels() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone());

        cache
            .set("vendas:k", &json!({"n": 1}), SetOptions::for_module("vendas"))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let value: serde_json::Value = cache.get("vendas:k", Some("vendas")).await.unwrap();
        assert_eq!(value["n"], 1);
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_local() {
        let store = Arc::new(MemoryStore::new());
        let writer = manager_with(store.clone());
        let reader = manager_with(store.clone());

        writer
            .set("vendas:k", &"shared", SetOptions::for_module("vendas"))
            .await
            .unwrap();

        let first: String = reader.get("vendas:k", Some("vendas")).await.unwrap();
        assert_eq!(first, "shared");
        assert_eq!(reader.stats().remote_hits, 1);

        let _: String = reader.get("vendas:k", Some("vendas")).await.unwrap();
        assert_eq!(reader.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_local_only_strategy_skips_remote() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone());
        cache.set_strategy(CacheStrategy::for_module("vendas", 60).with_level(CacheLevel::Local));

        cache
            .set("vendas:k", &1, SetOptions::for_module("vendas"))
            .await
            .unwrap();
        assert!(store.is_empty());
        assert_eq!(cache.get::<i32>("vendas:k", Some("vendas")).await, Some(1));
    }

    #[tokio::test]
    async fn test_reads_follow_table_strategy() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone());
        cache.set_strategy(CacheStrategy::for_table("vendas", "pedidos", 60).with_level(CacheLevel::Local));

        let options = SetOptions::for_module("vendas").table("pedidos");
        cache.set("vendas:p", &7, options).await.unwrap();
        assert!(store.is_empty());

        // Another instance sharing the remote store must not see local-only entries
        let other = manager_with(store.clone());
        assert_eq!(other.get_for_table::<i32>("vendas:p", Some("vendas"), Some("pedidos")).await, None);
        assert_eq!(other.stats().remote_hits, 0);

        assert_eq!(cache.get_for_table::<i32>("vendas:p", Some("vendas"), Some("pedidos")).await, Some(7));
        assert_eq!(cache.stats().local_hits, 1);

        // A remote-only table never reads the local level
        cache.set_strategy(CacheStrategy::for_table("vendas", "itens", 60).with_level(CacheLevel::Remote));
        cache.set("vendas:i", &3, SetOptions::for_module("vendas")).await.unwrap();
        assert_eq!(cache.get_for_table::<i32>("vendas:i", Some("vendas"), Some("itens")).await, Some(3));
        assert_eq!(cache.stats().remote_hits, 1);
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = manager_with(store.clone());
        cache.set_strategy(CacheStrategy::for_module("vendas", 60).with_level(CacheLevel::Remote));

        store.set_available(false);
        cache
            .set("vendas:k", &1, SetOptions::for_module("vendas"))
            .await
            .unwrap();
        assert!(!cache.is_connected());
        assert_eq!(cache.get::<i32>("vendas:k", Some("vendas")).await, None);

        store.set_available(true);
        assert!(cache.ping().await);
        assert!(cache.is_connected());
    }

    #[tokio::test]
    async fn test_cache_query_read_through() {
        let cache = manager_with(Arc::new(MemoryStore::new()));
        let calls = AtomicU64::new(0);

        for _ in 0..3 {
            let value: Vec<i32> = cache
                .cache_query("vendas:q", SetOptions::for_module("vendas"), false, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _: Vec<i32> = cache
            .cache_query("vendas:q", SetOptions::for_module("vendas"), true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![4])
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_module_emits_event() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cache = CacheManager::new(CacheSettings::default(), Arc::new(MemoryStore::new()), events);

        cache.set("vendas:a", &1, SetOptions::for_module("vendas")).await.unwrap();
        cache.set("estoque:a", &1, SetOptions::for_module("estoque")).await.unwrap();

        let removed = cache.invalidate_module("vendas", "write").await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get::<i32>("vendas:a", Some("vendas")).await.is_none());
        assert!(cache.get::<i32>("estoque:a", Some("estoque")).await.is_some());

        match rx.recv().await.unwrap() {
            PlatformEvent::CacheInvalidated(event) => {
                assert_eq!(event.kind, InvalidationKind::Module);
                assert_eq!(event.target, "vendas");
                assert_eq!(event.reason, "write");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
