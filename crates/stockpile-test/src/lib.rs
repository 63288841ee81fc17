//! Helpers for testing the data-access core.
//!
//! [`MemoryStorage`] stands in for the external key-value store. It can simulate latency and
//! failures, and counts the calls it receives, which is what most deduplication tests assert on.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use stockpile_service::config::ScopeConfig;
use stockpile_service::scope::TaskScope;
use stockpile_service::storage::Storage;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `stockpile` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "stockpile_service=trace,stockpile_cache=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates an initialized [`TaskScope`] on the current runtime.
///
/// # Panics
///
/// Panics when called outside of a tokio runtime.
pub fn ready_scope() -> Arc<TaskScope> {
    let scope = TaskScope::new(
        Handle::current(),
        ScopeConfig {
            shutdown_timeout: Duration::from_secs(1),
        },
    );
    scope.initialize();
    Arc::new(scope)
}

/// An in-memory [`Storage`] with configurable latency and failures.
#[derive(Debug)]
pub struct MemoryStorage<K, V> {
    records: Mutex<HashMap<K, V>>,
    failing: Mutex<HashSet<K>>,
    latency: Duration,
    failure_rate: f64,
    reads: AtomicUsize,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl<K, V> Default for MemoryStorage<K, V> {
    fn default() -> Self {
        Self {
            records: Mutex::default(),
            failing: Mutex::default(),
            latency: Duration::ZERO,
            failure_rate: 0.0,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }
}

impl<K, V> MemoryStorage<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates an empty storage that answers immediately and never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails every operation with the probability `failure_rate`.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate;
        self
    }

    /// Stores a record without counting it as a write.
    pub fn seed(&self, key: K, value: V) {
        self.records.lock().unwrap().insert(key, value);
    }

    /// The stored record of `key`, without counting it as a read.
    pub fn record(&self, key: &K) -> Option<V> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// Makes all operations on `key` fail until [`recover`](Self::recover) is called.
    pub fn fail_on(&self, key: K) {
        self.failing.lock().unwrap().insert(key);
    }

    /// Undoes [`fail_on`](Self::fail_on).
    pub fn recover(&self, key: &K) {
        self.failing.lock().unwrap().remove(key);
    }

    /// The number of reads received so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The number of writes received so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// The number of deletes received so far.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn simulate(&self, key: &K) -> anyhow::Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.lock().unwrap().contains(key) {
            anyhow::bail!("storage unavailable");
        }
        if self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate {
            anyhow::bail!("storage unavailable (simulated)");
        }
        Ok(())
    }
}

impl<K, V> Storage<K, V> for MemoryStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get<'a>(&'a self, key: &'a K) -> BoxFuture<'a, anyhow::Result<Option<V>>> {
        async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.simulate(key).await?;
            Ok(self.record(key))
        }
        .boxed()
    }

    fn put(&self, key: K, value: V) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.simulate(&key).await?;
            self.records.lock().unwrap().insert(key, value);
            Ok(())
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a K) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.simulate(key).await?;
            self.records.lock().unwrap().remove(key);
            Ok(())
        }
        .boxed()
    }
}
