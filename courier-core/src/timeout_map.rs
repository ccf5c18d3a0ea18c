//! Timeout Map
//!
//! Concurrent map whose entries expire a fixed time after their last `put` or
//! `get`. A periodic sweep removes expired entries in ascending expiry order
//! and reports them to listeners once the map lock has been released, so a
//! listener may call back into the map.

use crate::clock::{Clock, SystemClock};
use crate::executor::{ExecutorError, Schedule, ScheduledExecutor, TaskHandle};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Default period between sweeps
pub const DEFAULT_PURGE_POLL_TIME: Duration = Duration::from_millis(1000);

/// Timeout map errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TimeoutMapError {
    #[error("Cannot start timeout map: {0}")]
    ExecutorUnavailable(#[from] ExecutorError),

    #[error("Timeout map already started")]
    AlreadyStarted,
}

/// Result type for timeout map operations
pub type TimeoutMapResult<T> = Result<T, TimeoutMapError>;

/// Kind of change reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutMapEvent {
    Put,
    Remove,
    Evict,
}

/// Observer of map changes
///
/// Panics raised by a listener are caught and dropped.
pub trait TimeoutMapListener<K, V>: Send + Sync {
    fn on_event(&self, event: TimeoutMapEvent, key: &K, value: &V);
}

impl<K, V, F> TimeoutMapListener<K, V> for F
where
    F: Fn(TimeoutMapEvent, &K, &V) + Send + Sync,
{
    fn on_event(&self, event: TimeoutMapEvent, key: &K, value: &V) {
        self(event, key, value)
    }
}

/// Veto hook consulted for each expired entry before it is evicted
pub type EvictionFilter<K, V> = Arc<dyn Fn(&K, &V) -> bool + Send + Sync>;

struct TimeoutEntry<V> {
    value: V,
    timeout_millis: u64,
    expire_at: u64,
}

impl<V> TimeoutEntry<V> {
    fn new(value: V, timeout: Duration, now: u64) -> Self {
        let timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        Self {
            value,
            timeout_millis,
            expire_at: now.saturating_add(timeout_millis),
        }
    }

    fn touch(&mut self, now: u64) {
        self.expire_at = now.saturating_add(self.timeout_millis);
    }
}

struct Inner<K, V> {
    map: Mutex<AHashMap<K, TimeoutEntry<V>>>,
    listeners: RwLock<Vec<Arc<dyn TimeoutMapListener<K, V>>>>,
    eviction_filter: RwLock<Option<EvictionFilter<K, V>>>,
    clock: Arc<dyn Clock>,
    purge_poll_time: Duration,
    sweep: Mutex<Option<TaskHandle>>,
}

/// Map with TTL-on-access expiry
///
/// Cloning yields another handle to the same map.
pub struct TimeoutMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for TimeoutMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TimeoutMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a map on the system clock
    pub fn new(purge_poll_time: Duration) -> Self {
        Self::with_clock(purge_poll_time, Arc::new(SystemClock))
    }

    /// Create a map on the given clock
    pub fn with_clock(purge_poll_time: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                map: Mutex::new(AHashMap::new()),
                listeners: RwLock::new(Vec::new()),
                eviction_filter: RwLock::new(None),
                clock,
                purge_poll_time,
                sweep: Mutex::new(None),
            }),
        }
    }

    pub fn purge_poll_time(&self) -> Duration {
        self.inner.purge_poll_time
    }

    /// Register a listener
    pub fn add_listener(&self, listener: impl TimeoutMapListener<K, V> + 'static) {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// Install the hook deciding whether an expired entry may be evicted
    pub fn set_eviction_filter<F>(&self, filter: F)
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        *self.inner.eviction_filter.write() = Some(Arc::new(filter));
    }

    /// Get a value, refreshing its expiry
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.inner.clock.now_millis();
        let mut map = self.inner.map.lock();
        map.get_mut(key).map(|entry| {
            entry.touch(now);
            entry.value.clone()
        })
    }

    /// Insert a value, returning the previous one
    pub fn put(&self, key: K, value: V, timeout: Duration) -> Option<V> {
        let now = self.inner.clock.now_millis();
        let entry = TimeoutEntry::new(value.clone(), timeout, now);
        let previous = {
            let mut map = self.inner.map.lock();
            map.insert(key.clone(), entry)
        };
        self.notify(TimeoutMapEvent::Put, &key, &value);
        previous.map(|e| e.value)
    }

    /// Insert a value unless the key is present
    ///
    /// Returns the existing value when there was one, in which case nothing changes.
    pub fn put_if_absent(&self, key: K, value: V, timeout: Duration) -> Option<V> {
        let now = self.inner.clock.now_millis();
        {
            let mut map = self.inner.map.lock();
            if let Some(existing) = map.get(&key) {
                return Some(existing.value.clone());
            }
            map.insert(key.clone(), TimeoutEntry::new(value.clone(), timeout, now));
        }
        self.notify(TimeoutMapEvent::Put, &key, &value);
        None
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.map.lock().remove(key);
        removed.map(|entry| {
            self.notify(TimeoutMapEvent::Remove, key, &entry.value);
            entry.value
        })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.map.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.map.lock().keys().cloned().collect()
    }

    /// Evict expired entries now, returning how many were evicted
    pub fn purge(&self) -> usize {
        Self::purge_inner(&self.inner)
    }

    fn purge_inner(inner: &Inner<K, V>) -> usize {
        let now = inner.clock.now_millis();
        let filter = inner.eviction_filter.read().clone();

        let evicted: Vec<(K, V)> = {
            let mut map = inner.map.lock();
            let mut expired: Vec<(K, u64)> = map
                .iter()
                .filter(|(key, entry)| {
                    entry.expire_at < now
                        && filter
                            .as_ref()
                            .map_or(true, |is_valid| is_valid(key, &entry.value))
                })
                .map(|(key, entry)| (key.clone(), entry.expire_at))
                .collect();
            expired.sort_by_key(|(_, expire_at)| *expire_at);

            expired
                .into_iter()
                .filter_map(|(key, _)| map.remove(&key).map(|entry| (key, entry.value)))
                .collect()
        };

        if !evicted.is_empty() {
            trace!(evicted = evicted.len(), now, "Evicted expired entries");
        }
        for (key, value) in &evicted {
            Self::notify_inner(inner, TimeoutMapEvent::Evict, key, value);
        }
        evicted.len()
    }

    fn notify(&self, event: TimeoutMapEvent, key: &K, value: &V) {
        Self::notify_inner(&self.inner, event, key, value);
    }

    fn notify_inner(inner: &Inner<K, V>, event: TimeoutMapEvent, key: &K, value: &V) {
        let listeners = inner.listeners.read().clone();
        for listener in listeners {
            let _ = catch_unwind(AssertUnwindSafe(|| listener.on_event(event, key, value)));
        }
    }

    /// Start the periodic sweep on the executor
    pub fn start(&self, executor: &ScheduledExecutor) -> TimeoutMapResult<()> {
        if executor.is_shutdown() {
            return Err(ExecutorError::Shutdown(executor.name().to_string()).into());
        }
        let mut sweep = self.inner.sweep.lock();
        if sweep.is_some() {
            return Err(TimeoutMapError::AlreadyStarted);
        }

        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        let period = self.inner.purge_poll_time;
        let handle = executor.schedule_fn(
            Schedule::FixedRate {
                initial_delay: period,
                period,
            },
            move || {
                if let Some(inner) = weak.upgrade() {
                    Self::purge_inner(&inner);
                }
            },
        )?;
        *sweep = Some(handle);
        debug!(purge_poll_time_ms = period.as_millis() as u64, "Timeout map started");
        Ok(())
    }

    /// Cancel the sweep and clear the map without notifying listeners
    pub fn stop(&self) {
        if let Some(handle) = self.inner.sweep.lock().take() {
            handle.cancel();
        }
        self.inner.map.lock().clear();
        debug!("Timeout map stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.sweep.lock().is_some()
    }
}

impl<K, V> fmt::Debug for TimeoutMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutMap")
            .field("size", &self.inner.map.lock().len())
            .field("purge_poll_time", &self.inner.purge_poll_time)
            .finish()
    }
}
