use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A snapshot of the statistics of a cache.
///
/// All counters increase monotonically over the lifetime of the cache. Rates are derived
/// from the counters whenever they are read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found a value.
    pub hit_count: u64,
    /// Number of lookups that did not find a value.
    pub miss_count: u64,
    /// Number of loads that completed, whether or not they produced a value.
    pub load_success_count: u64,
    /// Number of loads that returned an error.
    pub load_failure_count: u64,
    /// Total time spent in loads, successful or not.
    pub total_load_time: Duration,
    /// Number of entries removed because of capacity or expiry.
    ///
    /// Explicit invalidation is not counted.
    pub eviction_count: u64,
}

impl CacheStats {
    /// The number of lookups, hits and misses combined.
    pub fn request_count(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    /// The ratio of lookups that were hits, or `0.0` if there were no lookups.
    pub fn hit_rate(&self) -> f64 {
        match self.request_count() {
            0 => 0.0,
            requests => self.hit_count as f64 / requests as f64,
        }
    }

    /// The ratio of lookups that were misses, or `0.0` if there were no lookups.
    pub fn miss_rate(&self) -> f64 {
        match self.request_count() {
            0 => 0.0,
            requests => self.miss_count as f64 / requests as f64,
        }
    }

    /// The number of loads, successful and failed.
    pub fn load_count(&self) -> u64 {
        self.load_success_count + self.load_failure_count
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats(hit_rate={:.2}%, hits={}, misses={}, loads={}, load_failures={}, evictions={})",
            self.hit_rate() * 100.0,
            self.hit_count,
            self.miss_count,
            self.load_success_count,
            self.load_failure_count,
            self.eviction_count,
        )
    }
}

/// Thread-safe counters backing a [`CacheStats`] snapshot.
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    load_nanos: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    #[inline]
    fn bump(&self, counter: &AtomicU64, value: u64) {
        if self.enabled {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn record_hit(&self) {
        self.bump(&self.hits, 1);
    }

    pub fn record_miss(&self) {
        self.bump(&self.misses, 1);
    }

    pub fn record_load_success(&self, elapsed: Duration) {
        self.bump(&self.load_successes, 1);
        self.bump(&self.load_nanos, elapsed.as_nanos() as u64);
    }

    pub fn record_load_failure(&self, elapsed: Duration) {
        self.bump(&self.load_failures, 1);
        self.bump(&self.load_nanos, elapsed.as_nanos() as u64);
    }

    pub fn record_eviction(&self) {
        self.bump(&self.evictions, 1);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            load_success_count: self.load_successes.load(Ordering::Relaxed),
            load_failure_count: self.load_failures.load(Ordering::Relaxed),
            total_load_time: Duration::from_nanos(self.load_nanos.load(Ordering::Relaxed)),
            eviction_count: self.evictions.load(Ordering::Relaxed),
        }
    }
}
