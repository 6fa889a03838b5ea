//! Task output cache with LRU eviction and optional TTL expiration.
//!
//! Entries are keyed by a [`Fingerprint`] of (task type, resolved input).
//! The cache is shared process-wide; writes for the same key are idempotent
//! and last-writer-wins.

use crate::config::CacheConfig;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Stable hash of a task type and its resolved input.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `input` for `task_type`.
    ///
    /// Object keys are hashed in sorted order so structurally identical
    /// inputs produce the same fingerprint regardless of insertion order.
    pub fn compute(task_type: &str, input: &Value) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(task_type.as_bytes());
        hasher.update(&[0]);
        hash_canonical(&mut hasher, input);
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hash_canonical(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_canonical(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
            hasher.update(b";");
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
    /// Recency stamp; matches exactly one live slot in the order queue
    stamp: u64,
}

struct CacheInner<V> {
    entries: HashMap<Fingerprint, CacheEntry<V>>,
    /// Keys from least to most recently used. A slot whose stamp no longer
    /// matches its entry is stale and skipped.
    order: VecDeque<(Fingerprint, u64)>,
    next_stamp: u64,
    hits: u64,
    misses: u64,
}

impl<V> CacheInner<V> {
    fn stamp(&mut self, key: &Fingerprint) -> u64 {
        self.next_stamp += 1;
        self.order.push_back((key.clone(), self.next_stamp));
        self.next_stamp
    }

    fn touch(&mut self, key: &Fingerprint) {
        if !self.entries.contains_key(key) {
            return;
        }
        let stamp = self.stamp(key);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.stamp = stamp;
        }
        self.compact();
    }

    fn is_live(&self, key: &Fingerprint, stamp: u64) -> bool {
        self.entries.get(key).is_some_and(|e| e.stamp == stamp)
    }

    fn evict_oldest(&mut self) -> Option<Fingerprint> {
        while let Some((key, stamp)) = self.order.pop_front() {
            if self.is_live(&key, stamp) {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    /// Drops stale slots once they outnumber live ones.
    fn compact(&mut self) {
        if self.order.len() <= 2 * self.entries.len() + 16 {
            return;
        }
        let order = std::mem::take(&mut self.order);
        self.order = order
            .into_iter()
            .filter(|(key, stamp)| self.is_live(key, *stamp))
            .collect();
    }

    fn remove(&mut self, key: &Fingerprint) {
        self.entries.remove(key);
    }
}

/// Hit/miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe output cache.
///
/// Cloning shares the underlying store.
pub struct OutputCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    max_entries: usize,
    ttl: Option<Duration>,
    inner: Arc<RwLock<CacheInner<V>>>,
}

impl<V> Clone for OutputCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            max_entries: self.max_entries,
            ttl: self.ttl,
            inner: self.inner.clone(),
        }
    }
}

impl<V> OutputCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `max_entries` outputs.
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            inner: Arc::new(RwLock::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_stamp: 0,
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl())
    }

    /// Gets a cached output if present and not expired.
    pub async fn get(&self, key: &Fingerprint) -> Option<V> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        let found = inner.entries.get(key).cloned();
        match found {
            Some(entry) if entry.expires_at.map_or(true, |at| now < at) => {
                inner.touch(key);
                inner.hits += 1;
                tracing::debug!("Output cache hit {}", key);
                Some(entry.value)
            }
            Some(_) => {
                inner.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Convenience wrapper computing the fingerprint first.
    pub async fn lookup(&self, task_type: &str, input: &Value) -> Option<V> {
        self.get(&Fingerprint::compute(task_type, input)).await
    }

    /// Stores an output, evicting the least recently used entry when full.
    pub async fn insert(&self, key: Fingerprint, value: V) {
        let mut inner = self.inner.write().await;

        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= self.max_entries {
                match inner.evict_oldest() {
                    Some(evicted) => tracing::trace!("Output cache evicted {}", evicted),
                    None => break,
                }
            }
        }

        let stamp = inner.stamp(&key);
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                stamp,
            },
        );
        inner.compact();
    }

    /// Removes a single entry.
    pub async fn invalidate(&self, key: &Fingerprint) {
        self.inner.write().await.remove(key);
    }

    /// Clears all entries and counters.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl<V> Default for OutputCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
