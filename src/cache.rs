//! Shared cache-aside store for the data loaders
//!
//! Entries are JSON strings stored under composite keys
//! `dl:{service}:{keyspace}:{id}` with a fixed TTL. Two stores are provided:
//!
//! - [`MemoryCacheStore`]: in-process map with per-entry TTL and a size bound
//! - [`RedisCacheStore`]: Redis through a reconnecting connection manager
//!
//! Store errors never fail a load; the loaders degrade a failed read to a miss
//! and a failed write to a skipped write.
//!
//! ## Example
//!
//! ```rust
//! use erp_gateway::{CacheKey, CacheStore, MemoryCacheStore};
//! use std::time::Duration;
//!
//! # async fn example() -> erp_gateway::Result<()> {
//! let store = MemoryCacheStore::new(10_000);
//! let key = CacheKey::new("crm", "contacts", "c1").to_string();
//! store.set_with_ttl(&key, r#"{"id":"c1"}"#, Duration::from_secs(60)).await?;
//! assert_eq!(store.multi_get(&[key]).await?[0].as_deref(), Some(r#"{"id":"c1"}"#));
//! # Ok(())
//! # }
//! ```

use crate::config::CacheSettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Prefix shared by every loader cache key
pub const KEY_PREFIX: &str = "dl";

/// Composite cache key for one entity in one key-space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service: String,
    pub keyspace: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(
        service: impl Into<String>,
        keyspace: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            keyspace: keyspace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            KEY_PREFIX, self.service, self.keyspace, self.id
        )
    }
}

/// Key/value store with TTL, batch reads and pattern deletes
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// One value (or `None`) per key, in key order
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a glob pattern (`*`, `?`); returns the count
    async fn scan_delete(&self, pattern: &str) -> Result<usize>;
}

/// Shared store handle
pub type SharedCacheStore = Arc<dyn CacheStore>;

/// Build the store described by the configuration
pub async fn cache_store_from_config(settings: &CacheSettings) -> Result<SharedCacheStore> {
    match &settings.redis_url {
        Some(url) => Ok(Arc::new(RedisCacheStore::connect(url).await?)),
        None => Ok(Arc::new(MemoryCacheStore::new(settings.max_entries))),
    }
}

/// Compile a Redis-style glob into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::Cache(format!("invalid pattern {pattern:?}: {e}")))
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    stored_at: Instant,
    ttl: Duration,
    /// Matches the `order` slot written with this value
    generation: u64,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    /// Write order for oldest-first eviction. Slots whose generation no longer
    /// matches the entry are stale and skipped.
    order: VecDeque<(u64, String)>,
    next_generation: u64,
}

impl MemoryInner {
    fn is_current(&self, generation: u64, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.compact();
        }
        removed
    }

    fn insert(&mut self, key: &str, value: &str, ttl: Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                stored_at: Instant::now(),
                ttl,
                generation,
            },
        );
        self.order.push_back((generation, key.to_string()));
        self.compact();
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((generation, key)) = self.order.pop_front() {
            if self.is_current(generation, &key) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    /// Drop stale slots once they outnumber live ones
    fn compact(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order.retain(|(generation, key)| {
                entries
                    .get(key)
                    .map(|e| e.generation == *generation)
                    .unwrap_or(false)
            });
        }
    }
}

/// In-process store with per-entry TTL and oldest-first eviction
#[derive(Debug)]
pub struct MemoryCacheStore {
    max_entries: usize,
    inner: RwLock<MemoryInner>,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: RwLock::new(MemoryInner::default()),
        }
    }

    /// Live entries (expired ones are not counted)
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
    }

    /// All live keys, for inspection
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|(generation, key)| {
                inner
                    .entries
                    .get(key)
                    .map(|e| e.generation == *generation && !e.is_expired())
                    .unwrap_or(false)
            })
            .map(|(_, key)| key.clone())
            .collect()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut expired = Vec::new();
        let values = {
            let inner = self.inner.read();
            keys.iter()
                .map(|key| match inner.entries.get(key) {
                    Some(entry) if entry.is_expired() => {
                        expired.push(key.clone());
                        None
                    }
                    Some(entry) => Some(entry.value.clone()),
                    None => None,
                })
                .collect()
        };

        if !expired.is_empty() {
            let mut inner = self.inner.write();
            for key in &expired {
                if inner.entries.get(key).map(MemoryEntry::is_expired).unwrap_or(false) {
                    inner.remove(key);
                }
            }
        }

        Ok(values)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.write();

        if !inner.entries.contains_key(key) {
            while inner.entries.len() >= self.max_entries {
                if !inner.evict_oldest() {
                    break;
                }
            }
        }

        inner.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.write().remove(key))
    }

    async fn scan_delete(&self, pattern: &str) -> Result<usize> {
        let matcher = glob_to_regex(pattern)?;
        let mut inner = self.inner.write();

        let doomed: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }

        debug!(pattern = %pattern, removed = doomed.len(), "Pattern delete");
        Ok(doomed.len())
    }
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: redis::aio::ConnectionManager,
    scan_count: usize,
}

impl RedisCacheStore {
    /// Connect to `url` (e.g. `redis://redis:6379/0`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        info!("Connected to Redis cache");
        Ok(Self {
            conn,
            scan_count: 100,
        })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn scan_delete(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let count: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += count.max(0) as usize;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed = removed, "Pattern delete");
        Ok(removed)
    }
}

impl fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("scan_count", &self.scan_count)
            .finish()
    }
}
