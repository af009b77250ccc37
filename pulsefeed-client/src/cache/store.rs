//! Sharded response cache with TTL, tag/dependency invalidation and
//! priority-aware LRU eviction

use crate::cache::{
    config::{CacheConfig, EvictionPolicy},
    entry::CacheEntry,
    invalidation::{CacheInvalidation, InvalidationEvent, InvalidationReason},
    types::{CacheKey, CachePriority, CacheStats, CacheValue},
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Options applied when storing a response
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Entry lifetime; the cache default applies when `None`
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub priority: CachePriority,
}

/// Response cache with TTL support and capacity eviction
///
/// Keys are spread over independently locked shards, so reads, writes and
/// evictions on one key never wait on an unrelated shard. Each shard keeps its
/// own tag index, dependency index and eviction order.
pub struct ResponseCache {
    pub(crate) config: CacheConfig,

    shards: Vec<RwLock<CacheShard>>,

    /// Monotonic access clock for LRU ordering
    clock: AtomicU64,

    counters: CacheCounters,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions_capacity: AtomicU64,
    evictions_ttl: AtomicU64,
    invalidations: AtomicU64,
}

struct StoredEntry {
    entry: CacheEntry,
    order: (u8, u64),
}

/// One lock domain of the cache
struct CacheShard {
    entries: HashMap<CacheKey, StoredEntry>,

    by_tag: HashMap<String, HashSet<CacheKey>>,

    by_dependency: HashMap<String, HashSet<CacheKey>>,

    /// (priority rank, last access) -> key; first element is the next victim
    eviction_order: BTreeMap<(u8, u64), CacheKey>,

    capacity: usize,

    size_bytes: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_tag: HashMap::new(),
            by_dependency: HashMap::new(),
            eviction_order: BTreeMap::new(),
            capacity,
            size_bytes: 0,
        }
    }

    fn insert(&mut self, entry: CacheEntry, order: (u8, u64)) {
        for tag in &entry.metadata.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        for dependency in &entry.metadata.dependencies {
            self.by_dependency
                .entry(dependency.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.eviction_order.insert(order, entry.key.clone());
        self.size_bytes += entry.metadata.size_bytes;
        self.entries
            .insert(entry.key.clone(), StoredEntry { entry, order });
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let stored = self.entries.remove(key)?;
        let entry = stored.entry;

        self.eviction_order.remove(&stored.order);
        for tag in &entry.metadata.tags {
            Self::unindex(&mut self.by_tag, tag, key);
        }
        for dependency in &entry.metadata.dependencies {
            Self::unindex(&mut self.by_dependency, dependency, key);
        }
        self.size_bytes = self.size_bytes.saturating_sub(entry.metadata.size_bytes);

        Some(entry)
    }

    fn unindex(index: &mut HashMap<String, HashSet<CacheKey>>, name: &str, key: &str) {
        if let Some(keys) = index.get_mut(name) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(name);
            }
        }
    }

    fn touch(&mut self, key: &str, order: (u8, u64)) {
        if let Some(stored) = self.entries.get_mut(key) {
            self.eviction_order.remove(&stored.order);
            stored.order = order;
            self.eviction_order.insert(order, key.to_string());
        }
    }

    /// Pop the next victim per the eviction order
    fn evict_one(&mut self) -> Option<CacheKey> {
        let key = self.eviction_order.first_key_value()?.1.clone();
        self.remove(&key).map(|entry| entry.key)
    }
}

impl ResponseCache {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!("Initializing response cache with config: {:?}", config);

        let shard_count = config.shards.max(1);
        let capacity = config.shard_capacity();
        let shards = (0..shard_count)
            .map(|_| RwLock::new(CacheShard::new(capacity)))
            .collect();

        Self {
            config,
            shards,
            clock: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a live value, removing it if it has expired
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let mut shard = self.shard_for(key).write().await;
        let now = Instant::now();

        let expired = match shard.entries.get(key) {
            Some(stored) => stored.entry.is_expired_at(now),
            None => {
                debug!("Cache miss: {}", key);
                self.record(&self.counters.misses, 1);
                return None;
            }
        };

        if expired {
            debug!("Cache entry expired: {}", key);
            shard.remove(key);
            self.record(&self.counters.misses, 1);
            self.record(&self.counters.evictions_ttl, 1);
            return None;
        }

        let order = self.next_order(shard.entries[key].entry.metadata.priority);
        shard.touch(key, order);
        self.record(&self.counters.hits, 1);

        debug!("Cache hit: {}", key);
        shard.entries.get(key).map(|stored| stored.entry.value.clone())
    }

    /// Get the full entry without touching LRU order or hit counters
    pub async fn peek(&self, key: &str) -> Option<CacheEntry> {
        let shard = self.shard_for(key).read().await;
        shard
            .entries
            .get(key)
            .filter(|stored| !stored.entry.is_expired())
            .map(|stored| stored.entry.clone())
    }

    /// Check if a live entry exists (without updating access order)
    pub async fn contains_key(&self, key: &str) -> bool {
        self.peek(key).await.is_some()
    }

    /// Insert a value with the default TTL and no tags
    pub async fn insert(&self, key: CacheKey, value: CacheValue) {
        self.set(key, value, SetOptions::default()).await
    }

    /// Install or replace an entry
    pub async fn set(&self, key: CacheKey, value: CacheValue, options: SetOptions) {
        let ttl = self
            .config
            .ttl_with_jitter(options.ttl.unwrap_or(self.config.default_ttl));
        let entry = CacheEntry::new(key.clone(), value, ttl)
            .with_tags(options.tags)
            .with_dependencies(options.dependencies)
            .with_priority(options.priority);
        self.set_entry(entry).await
    }

    /// Install a prepared entry, replacing any previous one for the key
    pub async fn set_entry(&self, entry: CacheEntry) {
        let order = self.next_order(entry.metadata.priority);
        let key = entry.key.clone();
        let mut shard = self.shard_for(&key).write().await;

        if shard.remove(&key).is_some() {
            debug!("Replacing cache entry: {}", key);
        } else {
            debug!("Inserting cache entry: {}", key);
        }

        self.evict_if_needed(&mut shard);
        shard.insert(entry, order);
    }

    /// Remove one key and cascade to its dependents
    pub async fn remove(&self, key: &str) -> Option<CacheValue> {
        self.remove_cascading(key).await.map(|(value, _)| value)
    }

    async fn remove_cascading(&self, key: &str) -> Option<(CacheValue, usize)> {
        let removed = {
            let mut shard = self.shard_for(key).write().await;
            shard.remove(key)
        }?;

        self.record(&self.counters.invalidations, 1);
        let cascaded = self.cascade(vec![key.to_string()]).await;
        debug!("Removed cache entry: {} ({} dependents)", key, cascaded.len());

        Some((removed.value, 1 + cascaded.len()))
    }

    /// Invalidate every entry carrying `tag`
    ///
    /// Once this returns, no later `get` observes an entry that carried the tag
    /// when the call started.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut removed = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write().await;
            let keys = shard.by_tag.remove(tag).unwrap_or_default();
            for key in keys {
                if shard.remove(&key).is_some() {
                    removed.push(key);
                }
            }
        }

        let direct = removed.len();
        let cascaded = self.cascade(removed).await;
        let total = direct + cascaded.len();
        self.record(&self.counters.invalidations, direct as u64);

        info!("Invalidated {} entries with tag: {}", total, tag);
        total
    }

    /// Invalidate every entry that lists `dependency`
    pub async fn invalidate_by_dependency(&self, dependency: &str) -> usize {
        let removed = self.cascade(vec![dependency.to_string()]).await;
        info!(
            "Invalidated {} entries depending on: {}",
            removed.len(),
            dependency
        );
        removed.len()
    }

    /// Invalidate every entry whose key starts with `prefix`
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut removed = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write().await;
            let keys: Vec<CacheKey> = shard
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            for key in keys {
                if shard.remove(&key).is_some() {
                    removed.push(key);
                }
            }
        }

        let direct = removed.len();
        let cascaded = self.cascade(removed).await;
        self.record(&self.counters.invalidations, direct as u64);

        info!("Invalidated {} entries with prefix: {}", direct + cascaded.len(), prefix);
        direct + cascaded.len()
    }

    /// Apply an invalidation target and report what was dropped
    pub async fn invalidate(&self, target: &CacheInvalidation) -> usize {
        match target {
            CacheInvalidation::All => self.clear().await,
            CacheInvalidation::Key(key) => self
                .remove_cascading(key)
                .await
                .map_or(0, |(_, count)| count),
            CacheInvalidation::Tag(tag) => self.invalidate_by_tag(tag).await,
            CacheInvalidation::Dependency(dependency) => {
                self.invalidate_by_dependency(dependency).await
            }
            CacheInvalidation::Prefix(prefix) => self.invalidate_by_prefix(prefix).await,
        }
    }

    /// Clear all entries from the cache
    pub async fn clear(&self) -> usize {
        let mut count = 0;

        for shard in &self.shards {
            let mut shard = shard.write().await;
            count += shard.entries.len();
            let capacity = shard.capacity;
            *shard = CacheShard::new(capacity);
        }

        self.record(&self.counters.invalidations, count as u64);
        info!("Cleared {} entries from cache", count);
        count
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> Vec<InvalidationEvent> {
        let now = Instant::now();
        let mut expired_keys = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write().await;
            let keys: Vec<CacheKey> = shard
                .entries
                .iter()
                .filter(|(_, stored)| stored.entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                shard.remove(&key);
                expired_keys.push(key);
            }
        }

        if expired_keys.is_empty() {
            return Vec::new();
        }

        self.record(&self.counters.evictions_ttl, expired_keys.len() as u64);
        debug!("Cleaned up {} expired entries", expired_keys.len());

        let count = expired_keys.len();
        vec![InvalidationEvent::new(InvalidationReason::Expired, expired_keys)
            .with_context(format!("Cleaned up {} expired entries", count))]
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let mut entries = 0;
        let mut size_bytes = 0;
        for shard in &self.shards {
            let shard = shard.read().await;
            entries += shard.entries.len();
            size_bytes += shard.size_bytes;
        }

        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries,
            size_bytes,
            evictions_capacity: self.counters.evictions_capacity.load(Ordering::Relaxed),
            evictions_ttl: self.counters.evictions_ttl.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Get number of entries in cache (expired entries not yet swept included)
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.entries.len();
        }
        total
    }

    /// Check if cache is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove entries depending on any of `triggers`, transitively
    ///
    /// Shards are locked one at a time; no lock is held across shards.
    async fn cascade(&self, triggers: Vec<String>) -> Vec<CacheKey> {
        let mut queue: VecDeque<String> = triggers.into();
        let mut seen: HashSet<String> = queue.iter().cloned().collect();
        let mut removed = Vec::new();

        while let Some(trigger) = queue.pop_front() {
            for shard in &self.shards {
                let mut shard = shard.write().await;
                let dependents = match shard.by_dependency.remove(&trigger) {
                    Some(keys) => keys,
                    None => continue,
                };
                for key in dependents {
                    if shard.remove(&key).is_some() {
                        if seen.insert(key.clone()) {
                            queue.push_back(key.clone());
                        }
                        removed.push(key);
                    }
                }
            }
        }

        if !removed.is_empty() {
            self.record(&self.counters.invalidations, removed.len() as u64);
        }
        removed
    }

    fn evict_if_needed(&self, shard: &mut CacheShard) {
        while shard.entries.len() >= shard.capacity {
            match shard.evict_one() {
                Some(key) => {
                    debug!("Evicting entry due to capacity limit: {}", key);
                    self.record(&self.counters.evictions_capacity, 1);
                }
                None => break,
            }
        }
    }

    fn next_order(&self, priority: CachePriority) -> (u8, u64) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let rank = match self.config.eviction_policy {
            EvictionPolicy::PriorityThenLru => priority.rank(),
            EvictionPolicy::Lru => 0,
        };
        (rank, tick)
    }

    fn shard_for(&self, key: &str) -> &RwLock<CacheShard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn record(&self, counter: &AtomicU64, n: u64) {
        if self.config.enable_metrics {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

/// Background task for automatic cache cleanup
///
/// Holds only a weak reference and exits once the cache is dropped.
pub async fn start_auto_cleanup(cache: Weak<ResponseCache>) {
    let interval = match cache.upgrade() {
        Some(cache) => cache.config.cleanup_interval,
        None => return,
    };

    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        let Some(cache) = cache.upgrade() else {
            debug!("Cache dropped, stopping cleanup task");
            return;
        };

        let events = cache.cleanup_expired().await;
        if !events.is_empty() {
            debug!("Auto cleanup: {} events", events.len());
        }
    }
}

/// Spawn [`start_auto_cleanup`] on the current runtime, if there is one
pub fn spawn_auto_cleanup(cache: &Arc<ResponseCache>) -> Option<tokio::task::JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(start_auto_cleanup(Arc::downgrade(cache))))
}
