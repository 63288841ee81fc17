use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Instant;

use crate::store::Store;
use crate::{CacheSettings, CacheStats};

/// The loader of a [`LoadingCache`].
///
/// The loader is responsible for producing the value of a key that is not cached. It is
/// implemented for all closures of the form `Fn(K) -> impl Future<Output = Result<Option<V>, E>>`.
pub trait CacheLoader<K, V>: Send + Sync {
    /// The error of a failed load.
    type Error: fmt::Display;
    /// The future performing the load.
    type Future: Future<Output = Result<Option<V>, Self::Error>> + Send;

    /// Loads the value of `key`.
    ///
    /// `Ok(None)` means that there is no value for `key`. Nothing will be cached in that case.
    fn load(&self, key: K) -> Self::Future;
}

impl<K, V, E, F, Fut> CacheLoader<K, V> for F
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<V>, E>> + Send,
    E: fmt::Display,
{
    type Error = E;
    type Future = Fut;

    fn load(&self, key: K) -> Self::Future {
        self(key)
    }
}

/// A bounded, expiring cache that loads missing values through a [`CacheLoader`].
///
/// A hit is served immediately, without suspending. A miss invokes the loader exactly once
/// per call; concurrent misses for the same key are *not* coalesced here. Load failures are
/// logged and counted, and turn into `None` for the caller.
pub struct LoadingCache<K, V, L> {
    store: Store<K, V>,
    loader: L,
}

impl<K, V, L> fmt::Debug for LoadingCache<K, V, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingCache")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<K, V, L> LoadingCache<K, V, L>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: CacheLoader<K, V>,
{
    /// Creates a new cache which calls `loader` on misses.
    pub fn new(settings: &CacheSettings, loader: L) -> Self {
        Self {
            store: Store::new(settings),
            loader,
        }
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Returns the cached value of `key`, loading it on a miss.
    ///
    /// Returns `None` if the loader produced no value or failed.
    pub async fn get(&self, key: &K) -> Option<V> {
        let counter = self.store.counter();
        if let Some(value) = self.store.get(key) {
            counter.record_hit();
            return Some(value);
        }
        counter.record_miss();

        let start = Instant::now();
        match self.loader.load(key.clone()).await {
            Ok(Some(value)) => {
                counter.record_load_success(start.elapsed());
                self.store.insert(key.clone(), value.clone());
                Some(value)
            }
            Ok(None) => {
                counter.record_load_success(start.elapsed());
                tracing::trace!(cache = self.name(), ?key, "Loader produced no value");
                None
            }
            Err(error) => {
                counter.record_load_failure(start.elapsed());
                tracing::warn!(
                    cache = self.name(),
                    ?key,
                    error = %error,
                    "Failed to load cache value",
                );
                None
            }
        }
    }

    /// Returns the cached value of `key` without loading it.
    ///
    /// This does not affect the statistics.
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        self.store.get(key)
    }

    /// Inserts `value` for `key`, replacing any previous value.
    pub fn put(&self, key: K, value: V) {
        self.store.insert(key, value);
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
