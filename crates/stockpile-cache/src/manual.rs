use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Instant;

use crate::store::Store;
use crate::{CacheSettings, CacheStats};

/// A bounded, expiring cache without a bound loader.
///
/// Expiry and eviction work exactly like in [`LoadingCache`](crate::LoadingCache). Values are
/// either inserted directly, or computed by a loader handed to one of the get-or-compute
/// methods. A loader that yields `None` does not cache anything.
pub struct ManualCache<K, V> {
    store: Store<K, V>,
}

impl<K, V> fmt::Debug for ManualCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualCache")
            .field("store", &self.store)
            .finish()
    }
}

impl<K, V> ManualCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new, empty cache.
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            store: Store::new(settings),
        }
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Returns the cached value of `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.store.get(key);
        match value {
            Some(_) => self.store.counter().record_hit(),
            None => self.store.counter().record_miss(),
        }
        value
    }

    /// Inserts `value` for `key`, replacing any previous value.
    pub fn put(&self, key: K, value: V) {
        self.store.insert(key, value);
    }

    /// Returns the cached value of `key`, or computes it with `f`.
    ///
    /// `f` runs to completion before this returns. Its value is cached unless it is `None`.
    pub fn get_or_insert_with<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        if let Some(value) = self.get(&key) {
            return Some(value);
        }

        let start = Instant::now();
        let loaded = f();
        self.store.counter().record_load_success(start.elapsed());

        if let Some(value) = &loaded {
            self.store.insert(key, value.clone());
        }
        loaded
    }

    /// Returns the cached value of `key`, or loads it with the asynchronous `f`.
    ///
    /// The value is cached unless it is `None`. Concurrent calls for the same key may each
    /// invoke their loader.
    pub async fn get_or_load<F, Fut>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<V>>,
    {
        if let Some(value) = self.get(&key) {
            return Some(value);
        }

        let start = Instant::now();
        let loaded = f().await;
        self.store.counter().record_load_success(start.elapsed());

        if let Some(value) = &loaded {
            self.store.insert(key, value.clone());
        }
        loaded
    }

    /// Removes the entry of `key`.
    pub fn invalidate(&self, key: &K) {
        self.store.invalidate(key);
    }

    /// Removes all entries.
    pub fn invalidate_all(&self) {
        self.store.invalidate_all();
    }

    /// The current number of entries.
    pub fn size(&self) -> u64 {
        self.store.size()
    }

    /// A snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Removes expired entries and applies pending evictions.
    pub fn run_pending_tasks(&self) {
        self.store.run_pending_tasks();
    }
}
