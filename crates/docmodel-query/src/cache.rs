//! Per-model read cache.
//!
//! Bounded by capacity (least recently used entry evicted first) and by
//! age: an entry older than the configured expiration is treated as absent
//! when it is next read. Nothing sweeps stale entries proactively.

use bson::Document;
use docmodel_core::{Result, SchemaDescriptor};
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// LRU cache whose entries expire after a fixed time-to-live.
///
/// # Example
///
/// ```
/// use docmodel_query::cache::LruTtlCache;
/// use std::time::Duration;
///
/// let mut cache = LruTtlCache::new(2, Duration::from_secs(60));
/// let v = cache.get_or_compute("k", || 1);
/// assert_eq!(v, 1);
/// // Second call is served from the cache.
/// assert_eq!(cache.get_or_compute("k", || 2), 1);
/// ```
#[derive(Debug)]
pub struct LruTtlCache<V> {
    entries: LruCache<String, (Instant, V)>,
    ttl: Duration,
}

impl<V: Clone> LruTtlCache<V> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Read `key` as of `now`. A stale entry is dropped and reported absent.
    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<V> {
        let (inserted, value) = self.entries.pop(key)?;
        if now.saturating_duration_since(inserted) > self.ttl {
            return None;
        }
        self.entries.put(key.to_string(), (inserted, value.clone()));
        Some(value)
    }

    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.set_at(key, value, Instant::now());
    }

    pub fn set_at(&mut self, key: impl Into<String>, value: V, now: Instant) {
        if let Some((evicted, _)) = self.entries.push(key.into(), (now, value)) {
            tracing::trace!(key = %evicted, "Cache entry evicted");
        }
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    pub fn get_or_compute(&mut self, key: &str, compute: impl FnOnce() -> V) -> V {
        self.get_or_compute_at(key, Instant::now(), compute)
    }

    pub fn get_or_compute_at(&mut self, key: &str, now: Instant, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get_at(key, now) {
            return value;
        }
        let value = compute();
        self.set_at(key, value.clone(), now);
        value
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Raw driver result held by the read cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResult {
    Documents(Vec<Document>),
    Count(u64),
}

pub type SharedCache = Arc<Mutex<LruTtlCache<CachedResult>>>;

fn caches() -> &'static Mutex<HashMap<&'static str, SharedCache>> {
    static CACHES: OnceLock<Mutex<HashMap<&'static str, SharedCache>>> = OnceLock::new();
    CACHES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The cache of `schema`, created on first use. `None` when caching is off.
pub fn cache_for(schema: &'static SchemaDescriptor) -> Option<SharedCache> {
    let settings = &schema.settings;
    if !settings.use_cache {
        return None;
    }
    let mut caches = caches().lock().unwrap_or_else(PoisonError::into_inner);
    let cache = caches.entry(schema.name).or_insert_with(|| {
        tracing::debug!(
            schema = schema.name,
            capacity = settings.cache_capacity,
            expiration_secs = settings.cache_expiration.as_secs_f64(),
            "Created read cache"
        );
        Arc::new(Mutex::new(LruTtlCache::new(
            settings.cache_capacity,
            settings.cache_expiration,
        )))
    });
    Some(Arc::clone(cache))
}

/// Lock a shared cache, recovering from poisoning.
pub fn lock(cache: &SharedCache) -> std::sync::MutexGuard<'_, LruTtlCache<CachedResult>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shape of a read, serialized into its cache key.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueryShape<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub filter: &'a Document,
    pub projection: Option<&'a Document>,
    pub fetch_links: bool,
    pub sort: Option<&'a Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

impl QueryShape<'_> {
    pub fn cache_key(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::cell::Cell;

    #[test]
    fn capacity_overflow_evicts_least_recently_accessed() {
        let mut cache = LruTtlCache::new(2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        // Touch "a" so "b" becomes least recently used.
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn fresh_entries_survive_and_stale_entries_recompute_once() {
        let ttl = Duration::from_secs(10);
        let start = Instant::now();
        let mut cache = LruTtlCache::new(4, ttl);
        let calls = Cell::new(0);
        let compute = |v: i32| {
            calls.set(calls.get() + 1);
            v
        };

        assert_eq!(cache.get_or_compute_at("k", start, || compute(1)), 1);
        let fresh = start + Duration::from_secs(10);
        assert_eq!(cache.get_or_compute_at("k", fresh, || compute(2)), 1);
        assert_eq!(calls.get(), 1);

        let stale = start + Duration::from_secs(11);
        assert_eq!(cache.get_or_compute_at("k", stale, || compute(3)), 3);
        assert_eq!(calls.get(), 2);
        // The recomputed value replaced the old one.
        assert_eq!(cache.get_at("k", stale), Some(3));
    }

    #[test]
    fn stale_entry_is_dropped_on_read() {
        let start = Instant::now();
        let mut cache = LruTtlCache::new(4, Duration::from_secs(1));
        cache.set_at("k", "v", start);
        assert_eq!(cache.get_at("k", start + Duration::from_secs(2)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let mut cache = LruTtlCache::new(0, Duration::from_secs(1));
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_keys_distinguish_query_shapes() {
        let filter = doc! { "a": 1 };
        let sort = doc! { "a": -1 };
        let base = QueryShape {
            kind: "FindMany",
            filter: &filter,
            projection: None,
            fetch_links: false,
            sort: None,
            skip: None,
            limit: None,
        };
        let sorted = QueryShape {
            sort: Some(&sort),
            ..base
        };
        let base_key = base.cache_key().expect("key");
        assert_ne!(base_key, sorted.cache_key().expect("key"));
        assert!(base_key.contains("FindMany"));
    }
}
