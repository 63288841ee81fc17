use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use crate::{CacheSettings, CacheStats, StatsCounter};

/// The entry table shared by both cache flavors.
///
/// Expiry is checked by moka on every read, so an entry past its time-to-live is never
/// returned even before the maintenance tasks removed it. Writes run the maintenance tasks
/// eagerly, which keeps the entry count within `max_capacity` as soon as `insert` returns.
pub(crate) struct Store<K, V> {
    name: Arc<str>,
    entries: Cache<K, V>,
    stats: Arc<StatsCounter>,
}

impl<K, V> fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("entries", &self.entries.entry_count())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(settings: &CacheSettings) -> Self {
        let stats = Arc::new(StatsCounter::new(settings.record_stats));

        let evictions = Arc::clone(&stats);
        let entries = Cache::builder()
            .name(&settings.name)
            .max_capacity(settings.max_capacity)
            .time_to_live(settings.time_to_live)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |_key, _value, cause: RemovalCause| {
                // `Explicit` and `Replaced` are caller-driven and do not count as evictions.
                if cause.was_evicted() {
                    evictions.record_eviction();
                }
            })
            .build();

        Self {
            name: settings.name.as_str().into(),
            entries,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counter(&self) -> &StatsCounter {
        &self.stats
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, value);
        self.entries.run_pending_tasks();
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn size(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
