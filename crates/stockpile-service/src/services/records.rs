use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use stockpile_cache::{CacheLoader, CacheSettings, CacheStats, LoadingCache};

use crate::bridge::CompletionHandle;
use crate::error::Error;
use crate::inflight::InFlight;
use crate::scope::TaskScope;
use crate::storage::Storage;

/// How often a read is repeated when the record is written while it runs.
const MAX_READ_ATTEMPTS: usize = 3;

/// Reads records from storage, coalescing concurrent reads of the same key.
///
/// Every successful write of a key bumps its epoch. A storage read remembers the epoch it
/// started at, and is repeated if the key was written in the meantime, so a read that started
/// before a write never hands out the overwritten record.
struct StorageLoader<K, V, S> {
    storage: Arc<S>,
    epochs: Arc<DashMap<K, u64>>,
    inflight: InFlight<K, (u64, Option<V>)>,
}

impl<K, V, S> Clone for StorageLoader<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            epochs: Arc::clone(&self.epochs),
            inflight: self.inflight.clone(),
        }
    }
}

impl<K, V, S> StorageLoader<K, V, S>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    /// The number of writes of `key` so far.
    fn epoch(&self, key: &K) -> u64 {
        self.epochs.get(key).map_or(0, |epoch| *epoch)
    }

    /// Marks `key` as written, invalidating reads that are still running.
    fn bump(&self, key: &K) {
        *self.epochs.entry(key.clone()).or_default() += 1;
    }

    fn read(&self, key: K) -> BoxFuture<'static, Result<Option<V>, Error>> {
        let loader = self.clone();
        async move {
            let mut attempts = 0;
            loop {
                let (started, value) = loader.read_once(key.clone()).await?;
                attempts += 1;
                if started == loader.epoch(&key) || attempts >= MAX_READ_ATTEMPTS {
                    return Ok(value);
                }
                tracing::trace!(
                    table = loader.inflight.name(),
                    ?key,
                    "Record written during read, reading again"
                );
            }
        }
        .boxed()
    }

    /// A single deduplicated storage read, along with the epoch it started at.
    fn read_once(&self, key: K) -> BoxFuture<'static, Result<(u64, Option<V>), Error>> {
        let storage = Arc::clone(&self.storage);
        let epochs = Arc::clone(&self.epochs);
        let stored_key = key.clone();
        self.inflight.fetch(key, move || {
            let started = epochs.get(&stored_key).map_or(0, |epoch| *epoch);
            async move {
                let value = storage.get(&stored_key).await?;
                Ok::<_, anyhow::Error>((started, value))
            }
        })
    }
}

impl<K, V, S> CacheLoader<K, V> for StorageLoader<K, V, S>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    type Error = Error;
    type Future = BoxFuture<'static, Result<Option<V>, Error>>;

    fn load(&self, key: K) -> Self::Future {
        self.read(key)
    }
}

/// A cached, deduplicated view on the records of one [`Storage`].
///
/// Reads go through a [`LoadingCache`]. Misses are fetched from storage at most once at a time
/// per key, no matter how many callers miss concurrently. Writes go to storage first and then
/// update the cache, so a caller always reads its own successful writes.
///
/// There are two flavors of reads: [`get`](Self::get) treats failures like missing records,
/// while [`fetch`](Self::fetch) reports them. Reads, saves and deletes also have `*_handle`
/// variants for callers that cannot `.await`.
pub struct RecordService<K, V, S> {
    scope: Arc<TaskScope>,
    storage: Arc<S>,
    reader: StorageLoader<K, V, S>,
    cache: LoadingCache<K, V, StorageLoader<K, V, S>>,
}

impl<K, V, S> fmt::Debug for RecordService<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordService")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<K, V, S> RecordService<K, V, S>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    /// Creates a service over `storage` whose fetches run in `scope`.
    pub fn new(settings: &CacheSettings, storage: Arc<S>, scope: Arc<TaskScope>) -> Self {
        let reader = StorageLoader {
            storage: Arc::clone(&storage),
            epochs: Arc::default(),
            inflight: InFlight::new(settings.name.as_str(), Arc::clone(&scope)),
        };
        Self {
            scope,
            storage,
            cache: LoadingCache::new(settings, reader.clone()),
            reader,
        }
    }

    /// The name of the underlying cache.
    pub fn name(&self) -> &str {
        self.cache.name()
    }

    /// Returns the record of `key`.
    ///
    /// `None` means that the record does not exist, or that it could not be read. Failures are
    /// logged and counted in the cache statistics.
    pub async fn get(&self, key: &K) -> Option<V> {
        let started = self.reader.epoch(key);
        let value = self.cache.get(key).await;
        self.discard_if_written(key, started);
        value
    }

    /// Returns the record of `key`, reporting failures to read it.
    pub async fn fetch(&self, key: &K) -> Result<Option<V>, Error> {
        if let Some(value) = self.cache.get_if_present(key) {
            return Ok(Some(value));
        }

        let started = self.reader.epoch(key);
        let loaded = self.reader.read(key.clone()).await?;
        if let Some(value) = &loaded {
            self.cache.put(key.clone(), value.clone());
            self.discard_if_written(key, started);
        }
        Ok(loaded)
    }

    /// Drops the cached record of `key` if it was written since `started`.
    ///
    /// A read racing with a write may have cached the overwritten record after the write
    /// updated the cache. Dropping the entry makes the next read go to storage.
    fn discard_if_written(&self, key: &K, started: u64) {
        if self.reader.epoch(key) != started {
            self.cache.invalidate(key);
        }
    }

    /// Returns the records of all `keys`, read concurrently.
    ///
    /// Records that do not exist, or could not be read, map to `None`.
    pub async fn get_many<I>(&self, keys: I) -> HashMap<K, Option<V>>
    where
        I: IntoIterator<Item = K>,
    {
        let reads = keys.into_iter().map(|key| async move {
            let value = self.get(&key).await;
            (key, value)
        });
        future::join_all(reads).await.into_iter().collect()
    }

    /// Writes `value` as the record of `key`.
    ///
    /// The cache is only updated once the storage write succeeded.
    pub async fn save(&self, key: K, value: V) -> Result<(), Error> {
        self.storage
            .put(key.clone(), value.clone())
            .await
            .map_err(Error::storage)?;
        self.reader.bump(&key);
        self.cache.put(key, value);
        Ok(())
    }

    /// Replaces the record of `key` with `transform` applied to it.
    ///
    /// Returns the new record, or `None` without writing anything if there is no record.
    /// This is a read followed by a write, concurrent updates of the same key can overwrite
    /// each other.
    pub async fn update<F>(&self, key: K, transform: F) -> Result<Option<V>, Error>
    where
        F: FnOnce(V) -> V,
    {
        let Some(current) = self.fetch(&key).await? else {
            return Ok(None);
        };
        let updated = transform(current);
        self.save(key, updated.clone()).await?;
        Ok(Some(updated))
    }

    /// Whether a record for `key` exists.
    pub async fn exists(&self, key: &K) -> Result<bool, Error> {
        Ok(self.fetch(key).await?.is_some())
    }

    /// Deletes the record of `key` from storage and the cache.
    pub async fn delete(&self, key: &K) -> Result<(), Error> {
        self.storage.delete(key).await.map_err(Error::storage)?;
        self.reader.bump(key);
        self.cache.invalidate(key);
        Ok(())
    }

    /// Drops the cached record of `key`, the next read goes to storage.
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Whether a storage read of `key` is running.
    pub fn is_loading(&self, key: &K) -> bool {
        self.reader.inflight.is_pending(key)
    }

    /// A snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Reports the cache size and statistics as gauges.
    pub fn report_metrics(&self) {
        let stats = self.cache.stats();
        let cache = self.cache.name();
        metric!(gauge("cache.size") = self.cache.size(), "cache" => cache);
        metric!(gauge("cache.hits") = stats.hit_count, "cache" => cache);
        metric!(gauge("cache.misses") = stats.miss_count, "cache" => cache);
        metric!(gauge("cache.load_failures") = stats.load_failure_count, "cache" => cache);
        metric!(gauge("cache.evictions") = stats.eviction_count, "cache" => cache);
        tracing::debug!(cache, "{stats}");
    }

    /// Reads the record of `key`, observed through a [`CompletionHandle`].
    ///
    /// Unlike [`get`](Self::get), a failed read fails the handle with the storage error.
    pub fn get_handle(self: &Arc<Self>, key: K) -> Result<CompletionHandle<Option<V>>, Error> {
        let service = Arc::clone(self);
        self.scope
            .to_completion_handle("records.get", async move { service.fetch(&key).await })
    }

    /// [`get_many`](Self::get_many) observed through a [`CompletionHandle`].
    pub fn get_many_handle(
        self: &Arc<Self>,
        keys: Vec<K>,
    ) -> Result<CompletionHandle<HashMap<K, Option<V>>>, Error> {
        let service = Arc::clone(self);
        self.scope.to_completion_handle("records.get_many", async move {
            Ok::<_, Error>(service.get_many(keys).await)
        })
    }

    /// [`exists`](Self::exists) observed through a [`CompletionHandle`].
    pub fn exists_handle(self: &Arc<Self>, key: K) -> Result<CompletionHandle<bool>, Error> {
        let service = Arc::clone(self);
        self.scope
            .to_completion_handle("records.exists", async move { service.exists(&key).await })
    }

    /// [`save`](Self::save) observed through a [`CompletionHandle`].
    pub fn save_handle(self: &Arc<Self>, key: K, value: V) -> Result<CompletionHandle<()>, Error> {
        let service = Arc::clone(self);
        self.scope
            .to_completion_handle("records.save", async move { service.save(key, value).await })
    }

    /// [`delete`](Self::delete) observed through a [`CompletionHandle`].
    pub fn delete_handle(self: &Arc<Self>, key: K) -> Result<CompletionHandle<()>, Error> {
        let service = Arc::clone(self);
        self.scope
            .to_completion_handle("records.delete", async move { service.delete(&key).await })
    }
}
