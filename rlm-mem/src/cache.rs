//! Read-through cache in front of the layered store.
//!
//! Entries are keyed per identity, since the same id or query resolves to
//! different partitions for different callers. Chunk entries are dropped when
//! their chunk is written. Query entries (list and search results) are
//! registered under every partition the query could read, and any commit to
//! one of those partitions drops them all.
//!
//! Invalidation runs as a [`PartitionObserver`], so it completes while the
//! writer still holds the partition lock. A generation counter keeps a reader
//! that raced with a write from inserting what it read before the write.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::memory::{
    ChunkFilter, ChunkId, LayeredMemoryStore, MemoryChunk, PartitionObserver, ScoredChunk,
};
use crate::policy::{Identity, Layer, PartitionKey};

/// Default number of cached entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Cache key for a chunk or a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Key of a single chunk as seen by `identity`.
    pub fn chunk(identity: &Identity, id: &ChunkId) -> Self {
        CacheKey(format!(
            "chunk:{}:{}:{}",
            identity.project_id, identity.agent_id, id
        ))
    }

    /// Key of a query from its normalized signature.
    pub fn query(identity: &Identity, kind: &str, signature: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identity.project_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(identity.agent_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(kind.as_bytes());
        hasher.update(b"\n");
        hasher.update(signature.as_bytes());
        CacheKey(format!("{}:{:x}", kind, hasher.finalize()))
    }

    /// Key of a list query. Tag order does not matter.
    pub fn list(identity: &Identity, filter: &ChunkFilter) -> Result<Self> {
        let mut normalized = filter.clone();
        normalized.tags.sort();
        normalized.tags.dedup();
        if let Some(layers) = normalized.layers.as_mut() {
            layers.sort();
            layers.dedup();
        }
        Ok(Self::query(identity, "list", &serde_json::to_string(&normalized)?))
    }

    /// Key of a search. Case and whitespace in the query do not matter.
    pub fn search(identity: &Identity, query: &str, limit: usize, layers: Option<&[Layer]>) -> Self {
        let normalized = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        let mut layers: Vec<&str> = layers
            .map(|ls| ls.iter().map(|l| l.name()).collect())
            .unwrap_or_default();
        layers.sort_unstable();
        layers.dedup();
        Self::query(
            identity,
            "search",
            &format!("{}|{}|{}", normalized, limit, layers.join(",")),
        )
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Chunk(MemoryChunk),
    Chunks(Vec<MemoryChunk>),
    Hits(Vec<ScoredChunk>),
}

/// Cumulative counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate miss rate.
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

/// Flat report of cache health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTelemetry {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub capacity: usize,
}

struct Entry {
    value: CachedValue,
    partitions: Vec<PartitionKey>,
    chunk: Option<ChunkId>,
}

struct CacheState {
    lru: LruCache<CacheKey, Entry>,
    by_partition: HashMap<PartitionKey, HashSet<CacheKey>>,
    by_chunk: HashMap<ChunkId, HashSet<CacheKey>>,
    generation: u64,
    stats: CacheStats,
}

impl CacheState {
    fn unregister(&mut self, key: &CacheKey, entry: &Entry) {
        for partition in &entry.partitions {
            if let Some(keys) = self.by_partition.get_mut(partition) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_partition.remove(partition);
                }
            }
        }
        if let Some(id) = &entry.chunk {
            if let Some(keys) = self.by_chunk.get_mut(id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_chunk.remove(id);
                }
            }
        }
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.lru.pop(key) {
            Some(entry) => {
                self.unregister(key, &entry);
                self.stats.invalidations += 1;
                true
            }
            None => false,
        }
    }
}

/// LRU cache of chunk reads and query results.
pub struct MemoryCache {
    state: Mutex<CacheState>,
}

impl MemoryCache {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                by_partition: HashMap::new(),
                by_chunk: HashMap::new(),
                generation: 0,
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..CacheStats::default()
                },
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock cache: {}", e)))
    }

    /// Current write generation. Pass it back to [`MemoryCache::insert`] so a
    /// value read before a concurrent write is not cached.
    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation)
    }

    /// Look up a key, counting the hit or miss.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CachedValue>> {
        let mut state = self.lock()?;
        let value = state.lru.get(key).map(|e| e.value.clone());
        if value.is_some() {
            state.stats.hits += 1;
            trace!(key = %key, "Cache hit");
        } else {
            state.stats.misses += 1;
        }
        Ok(value)
    }

    /// Insert a value read at `generation`. Returns `false` if a write
    /// happened since, in which case nothing is cached.
    pub fn insert(
        &self,
        key: CacheKey,
        value: CachedValue,
        partitions: Vec<PartitionKey>,
        chunk: Option<ChunkId>,
        generation: u64,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        if state.generation != generation {
            return Ok(false);
        }

        for partition in &partitions {
            state
                .by_partition
                .entry(partition.clone())
                .or_default()
                .insert(key.clone());
        }
        if let Some(id) = &chunk {
            state.by_chunk.entry(id.clone()).or_default().insert(key.clone());
        }

        let entry = Entry {
            value,
            partitions,
            chunk,
        };
        if let Some((old_key, old_entry)) = state.lru.push(key.clone(), entry) {
            if old_key != key {
                state.unregister(&old_key, &old_entry);
                state.stats.evictions += 1;
                debug!(key = %old_key, "Evicted cache entry");
            }
        }
        state.stats.entries = state.lru.len();
        Ok(true)
    }

    /// Drop every query entry over `partition` and the entries of `ids`.
    pub fn invalidate(&self, partition: &PartitionKey, ids: &[ChunkId]) -> Result<usize> {
        let mut state = self.lock()?;
        state.generation += 1;

        let mut keys: Vec<CacheKey> = state
            .by_partition
            .remove(partition)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(chunk_keys) = state.by_chunk.get(id) {
                keys.extend(chunk_keys.iter().cloned());
            }
        }

        let mut removed = 0;
        for key in &keys {
            if state.remove(key) {
                removed += 1;
            }
        }
        state.stats.entries = state.lru.len();
        if removed > 0 {
            debug!(partition = %partition, removed, "Invalidated cache entries");
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.lru.clear();
        state.by_partition.clear();
        state.by_chunk.clear();
        state.generation += 1;
        state.stats.entries = 0;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(self.lock()?.stats.clone())
    }

    pub fn telemetry(&self) -> Result<CacheTelemetry> {
        let stats = self.stats()?;
        Ok(CacheTelemetry {
            hit_rate: stats.hit_rate(),
            miss_rate: stats.miss_rate(),
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            invalidations: stats.invalidations,
            entries: stats.entries,
            capacity: stats.capacity,
        })
    }
}

impl PartitionObserver for MemoryCache {
    fn on_commit(&self, partition: &PartitionKey, ids: &[ChunkId]) {
        if let Err(e) = self.invalidate(partition, ids) {
            // A poisoned cache can no longer be trusted; drop everything it holds
            warn!(error = %e, "Cache invalidation failed");
            self.state.clear_poison();
            if let Ok(mut state) = self.state.lock() {
                state.lru.clear();
                state.by_partition.clear();
                state.by_chunk.clear();
                state.generation += 1;
            }
        }
    }
}

/// The store behind a read-through cache.
///
/// Writes go straight to the store; the cache hears about them through its
/// observer registration.
#[derive(Clone)]
pub struct CachedStore {
    store: Arc<LayeredMemoryStore>,
    cache: Arc<MemoryCache>,
}

impl CachedStore {
    pub fn new(store: Arc<LayeredMemoryStore>, cache: Arc<MemoryCache>) -> Result<Self> {
        store.add_observer(cache.clone())?;
        Ok(Self { store, cache })
    }

    pub fn store(&self) -> &LayeredMemoryStore {
        &self.store
    }

    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }

    /// Read a chunk. Cache hits do not count as accesses.
    pub fn get(&self, identity: &Identity, id: &ChunkId) -> Result<Option<MemoryChunk>> {
        self.read(identity, id, true)
    }

    /// Read a chunk without recording an access on a miss either.
    pub fn peek(&self, identity: &Identity, id: &ChunkId) -> Result<Option<MemoryChunk>> {
        self.read(identity, id, false)
    }

    fn read(&self, identity: &Identity, id: &ChunkId, touch: bool) -> Result<Option<MemoryChunk>> {
        let key = CacheKey::chunk(identity, id);
        if let Some(CachedValue::Chunk(chunk)) = self.cache.lookup(&key)? {
            return Ok(Some(chunk));
        }

        let generation = self.cache.generation()?;
        let chunk = if touch {
            self.store.get(identity, id)?
        } else {
            self.store.peek(identity, id)?
        };
        if let Some(chunk) = &chunk {
            self.cache.insert(
                key,
                CachedValue::Chunk(chunk.clone()),
                Vec::new(),
                Some(id.clone()),
                generation,
            )?;
        }
        Ok(chunk)
    }

    pub fn list(&self, identity: &Identity, filter: &ChunkFilter) -> Result<Vec<MemoryChunk>> {
        let key = CacheKey::list(identity, filter)?;
        if let Some(CachedValue::Chunks(chunks)) = self.cache.lookup(&key)? {
            return Ok(chunks);
        }

        let generation = self.cache.generation()?;
        let partitions = self
            .store
            .resolve(identity)?
            .readable_in(filter.layers.as_deref());
        let chunks = self.store.list(identity, filter)?;
        self.cache.insert(
            key,
            CachedValue::Chunks(chunks.clone()),
            partitions,
            None,
            generation,
        )?;
        Ok(chunks)
    }

    pub fn search(
        &self,
        identity: &Identity,
        query: &str,
        limit: usize,
        layers: Option<&[Layer]>,
    ) -> Result<Vec<ScoredChunk>> {
        let key = CacheKey::search(identity, query, limit, layers);
        if let Some(CachedValue::Hits(hits)) = self.cache.lookup(&key)? {
            return Ok(hits);
        }

        let generation = self.cache.generation()?;
        let partitions = self.store.resolve(identity)?.readable_in(layers);
        let hits = self.store.search(identity, query, limit, layers)?;
        self.cache.insert(
            key,
            CachedValue::Hits(hits.clone()),
            partitions,
            None,
            generation,
        )?;
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChunkUpdate, NewChunk};
    use crate::policy::{PolicyConfig, PolicyResolver};

    fn cached(capacity: usize) -> CachedStore {
        let store = Arc::new(LayeredMemoryStore::in_memory(
            PolicyResolver::new(PolicyConfig::default()).unwrap(),
        ));
        CachedStore::new(store, Arc::new(MemoryCache::new(capacity))).unwrap()
    }

    fn me() -> Identity {
        Identity::new("proj", "agent")
    }

    #[test]
    fn test_hit_after_miss() {
        let cs = cached(8);
        let chunk = cs.store().create(&me(), NewChunk::new("hello", "c"), None).unwrap();

        cs.get(&me(), &chunk.id).unwrap();
        cs.get(&me(), &chunk.id).unwrap();

        let stats = cs.cache().stats().unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.miss_rate(), 0.5);
    }

    #[test]
    fn test_update_invalidates_chunk() {
        let cs = cached(8);
        let chunk = cs.store().create(&me(), NewChunk::new("old", "c"), None).unwrap();
        assert_eq!(cs.get(&me(), &chunk.id).unwrap().unwrap().content, "old");

        cs.store()
            .update(&me(), &chunk.id, ChunkUpdate::content("new"))
            .unwrap();
        assert_eq!(cs.get(&me(), &chunk.id).unwrap().unwrap().content, "new");
    }

    #[test]
    fn test_write_invalidates_queries() {
        let cs = cached(8);
        cs.store()
            .create(&me(), NewChunk::new("rust notes", "c").with_tags(["rust"]), None)
            .unwrap();
        let filter = ChunkFilter::new().with_tag("rust");
        assert_eq!(cs.list(&me(), &filter).unwrap().len(), 1);
        assert_eq!(cs.search(&me(), "rust", 5, None).unwrap().len(), 1);

        cs.store()
            .create(&me(), NewChunk::new("more rust", "c").with_tags(["rust"]), None)
            .unwrap();
        assert_eq!(cs.list(&me(), &filter).unwrap().len(), 2);
        assert_eq!(cs.search(&me(), "RUST ", 5, None).unwrap().len(), 2);
        assert!(cs.cache().stats().unwrap().invalidations >= 2);
    }

    #[test]
    fn test_entries_are_per_identity() {
        let cs = cached(8);
        let chunk = cs.store().create(&me(), NewChunk::new("private", "c"), None).unwrap();
        assert!(cs.get(&me(), &chunk.id).unwrap().is_some());
        assert!(cs
            .get(&Identity::new("proj", "someone-else"), &chunk.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_lru_eviction_counted() {
        let cs = cached(2);
        let ids: Vec<ChunkId> = (0..3)
            .map(|i| {
                cs.store()
                    .create(&me(), NewChunk::new(format!("chunk {}", i), "c"), None)
                    .unwrap()
                    .id
            })
            .collect();
        for id in &ids {
            cs.get(&me(), id).unwrap();
        }
        let stats = cs.cache().stats().unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn test_stale_generation_not_inserted() {
        let cache = MemoryCache::new(4);
        let generation = cache.generation().unwrap();
        cache
            .invalidate(&PartitionKey::global(Layer::ProjectGlobal), &[])
            .unwrap();
        let inserted = cache
            .insert(
                CacheKey::query(&me(), "list", "x"),
                CachedValue::Chunks(Vec::new()),
                Vec::new(),
                None,
                generation,
            )
            .unwrap();
        assert!(!inserted);
    }

    #[test]
    fn test_telemetry_shape() {
        let cache = MemoryCache::new(0);
        let telemetry = cache.telemetry().unwrap();
        assert_eq!(telemetry.capacity, 1);
        assert_eq!(telemetry.hit_rate, 0.0);
        assert_eq!(telemetry.miss_rate, 0.0);
    }

    #[test]
    fn test_peek_does_not_count_access() {
        let cs = cached(8);
        let chunk = cs.store().create(&me(), NewChunk::new("quiet", "c"), None).unwrap();

        cs.peek(&me(), &chunk.id).unwrap();
        let stored = cs.store().peek(&me(), &chunk.id).unwrap().unwrap();
        assert_eq!(stored.metadata.access_count, 0);
    }
}
