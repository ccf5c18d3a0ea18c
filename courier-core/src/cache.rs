// LRU Cache - bounded access-order cache with an eviction callback
//
// Used for endpoint and service caches. The eviction listener sees the evicted
// entry before it is removed and can never fail the insert that caused it.

use crate::service::{MaybeStoppable, ServiceError};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use thiserror::Error;
use tracing::{debug, warn};

/// Eviction callback failure
#[derive(Debug, Clone, Error)]
#[error("Eviction callback failed: {0}")]
pub struct EvictionError(pub String);

impl From<ServiceError> for EvictionError {
    fn from(e: ServiceError) -> Self {
        EvictionError(e.to_string())
    }
}

/// Called with each entry evicted to keep the cache within bounds
pub trait EvictionListener<K, V>: Send + Sync {
    fn on_eviction(&self, key: &K, value: &V) -> Result<(), EvictionError>;
}

/// Eviction listener that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEviction;

impl<K, V> EvictionListener<K, V> for NoopEviction {
    fn on_eviction(&self, _key: &K, _value: &V) -> Result<(), EvictionError> {
        Ok(())
    }
}

/// Eviction listener that stops evicted values exposing a stop capability
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOnEviction;

impl<K, V: MaybeStoppable> EvictionListener<K, V> for StopOnEviction {
    fn on_eviction(&self, _key: &K, value: &V) -> Result<(), EvictionError> {
        match value.as_stoppable() {
            Some(stoppable) => stoppable.stop().map_err(EvictionError::from),
            None => Ok(()),
        }
    }
}

impl<K, V, F> EvictionListener<K, V> for F
where
    F: Fn(&K, &V) -> Result<(), EvictionError> + Send + Sync,
{
    fn on_eviction(&self, key: &K, value: &V) -> Result<(), EvictionError> {
        self(key, value)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry
    pub hits: u64,

    /// Lookups that found nothing
    pub misses: u64,

    /// Entries evicted to stay within bounds
    pub evictions: u64,

    /// Current entry count
    pub size: usize,

    /// Maximum entry count, 0 when unbounded
    pub max_size: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Access-ordered cache holding at most `max_size` entries
///
/// Inserting a new key into a full cache evicts the least recently used entry.
/// Lookups through [`LruCache::get`] count as a use, [`LruCache::peek`] does not.
/// A `max_size` of 0 disables the bound.
pub struct LruCache<K: Hash + Eq, V> {
    inner: lru::LruCache<K, V>,
    max_size: usize,
    listener: Box<dyn EvictionListener<K, V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    /// Create a cache with a no-op eviction listener
    pub fn new(max_size: usize) -> Self {
        Self::with_listener(max_size, NoopEviction)
    }

    /// Create a cache with the given eviction listener
    pub fn with_listener(max_size: usize, listener: impl EvictionListener<K, V> + 'static) -> Self {
        Self {
            inner: lru::LruCache::unbounded(),
            max_size,
            listener: Box::new(listener),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_bounded(&self) -> bool {
        self.max_size > 0
    }

    /// Get an entry, marking it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.inner.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Get a mutable entry, marking it most recently used
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.inner.get_mut(key) {
            Some(value) => {
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Get an entry without touching recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.peek(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.contains(key)
    }

    /// Insert an entry, returning the value it replaced
    ///
    /// Replacing an existing key never evicts.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if self.is_bounded() && !self.inner.contains(&key) && self.inner.len() >= self.max_size {
            self.evict_eldest();
        }
        self.inner.put(key, value)
    }

    fn evict_eldest(&mut self) {
        if let Some((key, value)) = self.inner.peek_lru() {
            let listener = &self.listener;
            match catch_unwind(AssertUnwindSafe(|| listener.on_eviction(key, value))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Error during eviction callback. This exception will be ignored");
                }
                Err(_) => warn!("Eviction callback panicked. This exception will be ignored"),
            }
        }
        if self.inner.pop_lru().is_some() {
            self.evictions += 1;
        }
    }

    /// Remove an entry without invoking the eviction listener
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.pop(key)
    }

    /// Remove every entry without invoking the eviction listener
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.iter().map(|(k, _)| k)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size: self.inner.len(),
            max_size: self.max_size,
        }
    }

    /// Reset hit, miss and eviction counters
    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }
}

impl<K: Hash + Eq, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("size", &self.inner.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Thread-safe wrapper serializing access to an [`LruCache`]
pub struct SynchronizedLruCache<K: Hash + Eq, V> {
    cache: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> SynchronizedLruCache<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self::from_cache(LruCache::new(max_size))
    }

    pub fn from_cache(cache: LruCache<K, V>) -> Self {
        Self {
            cache: Mutex::new(cache),
        }
    }

    /// Get a clone of an entry, marking it most recently used
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.lock().get(key).cloned()
    }

    /// Get an entry or insert the value produced by `create`
    pub fn get_or_insert_with<F>(&self, key: K, create: F) -> V
    where
        F: FnOnce() -> V,
    {
        let mut cache = self.cache.lock();
        if let Some(value) = cache.get(&key) {
            return value.clone();
        }
        let value = create();
        cache.put(key, value.clone());
        value
    }

    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.cache.lock().put(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.lock().remove(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.lock().contains(key)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

impl<K: Hash + Eq, V> fmt::Debug for SynchronizedLruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedLruCache")
            .field("cache", &*self.cache.lock())
            .finish()
    }
}

static WARM_UP: Once = Once::new();
static WARMED_UP: AtomicBool = AtomicBool::new(false);

/// Factory for the cache variants used across the framework
#[derive(Debug, Clone, Copy, Default)]
pub struct LruCacheFactory;

impl LruCacheFactory {
    /// Cache with a no-op eviction listener
    pub fn new_cache<K: Hash + Eq, V>(max_size: usize) -> LruCache<K, V> {
        LruCache::new(max_size)
    }

    /// Cache that stops evicted values
    pub fn new_stopping_cache<K: Hash + Eq, V: MaybeStoppable>(max_size: usize) -> LruCache<K, V> {
        LruCache::with_listener(max_size, StopOnEviction)
    }

    /// Thread-safe cache with a no-op eviction listener
    pub fn new_synchronized<K: Hash + Eq, V: Clone>(max_size: usize) -> SynchronizedLruCache<K, V> {
        SynchronizedLruCache::new(max_size)
    }

    /// Thread-safe cache that stops evicted values
    pub fn new_synchronized_stopping<K: Hash + Eq, V: Clone + MaybeStoppable>(
        max_size: usize,
    ) -> SynchronizedLruCache<K, V> {
        SynchronizedLruCache::from_cache(Self::new_stopping_cache(max_size))
    }

    /// Exercise the cache once per process so first real use pays no setup cost
    ///
    /// Returns `true` only for the call that performed the warm-up.
    pub fn warm_up() -> bool {
        let mut performed = false;
        WARM_UP.call_once(|| {
            let mut cache: LruCache<u32, Arc<str>> = LruCache::new(16);
            for i in 0..32 {
                cache.put(i, Arc::from("warm-up"));
                cache.get(&(i / 2));
            }
            WARMED_UP.store(true, Ordering::Release);
            performed = true;
            debug!(evictions = cache.stats().evictions, "LRU cache warmed up");
        });
        performed
    }

    pub fn is_warmed_up() -> bool {
        WARMED_UP.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceResult, Stoppable};
    use std::sync::atomic::AtomicUsize;

    fn recording_cache(
        max_size: usize,
    ) -> (LruCache<&'static str, i32>, Arc<Mutex<Vec<(&'static str, i32)>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = LruCache::with_listener(max_size, move |k: &&'static str, v: &i32| -> Result<(), EvictionError> {
            sink.lock().push((*k, *v));
            Ok(())
        });
        (cache, evicted)
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (mut cache, evicted) = recording_cache(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        // touch "a" so "b" becomes the eldest
        assert_eq!(cache.get("a"), Some(&1));
        cache.put("d", 4);

        assert_eq!(*evicted.lock(), vec![("b", 2)]);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("b"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replacing_key_does_not_evict() {
        let (mut cache, evicted) = recording_cache(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.put("a", 10), Some(1));

        assert!(evicted.lock().is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_peek_does_not_touch_recency() {
        let (mut cache, evicted) = recording_cache(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.peek("a"), Some(&1));
        cache.put("c", 3);

        assert_eq!(*evicted.lock(), vec![("a", 1)]);
    }

    #[test]
    fn test_zero_max_size_is_unbounded() {
        let (mut cache, evicted) = recording_cache(0);
        for (i, key) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
            cache.put(key, i as i32);
        }
        assert_eq!(cache.len(), 5);
        assert!(evicted.lock().is_empty());
        assert!(!cache.is_bounded());
    }

    #[test]
    fn test_failing_listener_is_swallowed() {
        let mut cache = LruCache::with_listener(1, |_k: &i32, _v: &i32| -> Result<(), EvictionError> {
            Err(EvictionError("listener broke".to_string()))
        });
        cache.put(1, 1);
        cache.put(2, 2);

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&2));
    }

    #[test]
    fn test_panicking_listener_does_not_break_put() {
        let mut cache = LruCache::with_listener(2, |k: &i32, _v: &i32| -> Result<(), EvictionError> {
            if *k == 1 {
                panic!("stop failed");
            }
            Ok(())
        });
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&1));
        assert!(cache.contains(&3));
        assert_eq!(cache.stats().evictions, 1);

        cache.put(4, 4);
        assert!(!cache.contains(&2));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_stats() {
        let mut cache: LruCache<i32, i32> = LruCache::new(4);
        cache.put(1, 1);
        cache.get(&1);
        cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio(), 0.5);

        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
    }

    struct Service {
        stops: AtomicUsize,
    }

    impl Stoppable for Service {
        fn stop(&self) -> ServiceResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl MaybeStoppable for Service {
        fn as_stoppable(&self) -> Option<&dyn Stoppable> {
            Some(self)
        }
    }

    #[test]
    fn test_stopping_cache_stops_evicted_service() {
        let first = Arc::new(Service {
            stops: AtomicUsize::new(0),
        });
        let second = Arc::new(Service {
            stops: AtomicUsize::new(0),
        });

        let cache = LruCacheFactory::new_synchronized_stopping(1);
        cache.put("first", Arc::clone(&first));
        cache.put("second", Arc::clone(&second));

        assert_eq!(first.stops.load(Ordering::SeqCst), 1);
        assert_eq!(second.stops.load(Ordering::SeqCst), 0);
        assert!(cache.get("second").is_some());
    }

    #[test]
    fn test_get_or_insert_with() {
        let cache: SynchronizedLruCache<String, i32> = LruCacheFactory::new_synchronized(2);
        assert_eq!(cache.get_or_insert_with("a".to_string(), || 1), 1);
        assert_eq!(cache.get_or_insert_with("a".to_string(), || 2), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_warm_up_runs_once() {
        let first = LruCacheFactory::warm_up();
        let second = LruCacheFactory::warm_up();
        assert!(!second);
        assert!(first || LruCacheFactory::is_warmed_up());
        assert!(LruCacheFactory::is_warmed_up());
    }
}
