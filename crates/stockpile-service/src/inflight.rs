//! Deduplication of concurrent fetches.
//!
//! While a fetch for a key is running, every further fetch of the same key joins it instead
//! of starting a new one. The fetch runs as its own task in the [`TaskScope`], so it is
//! independent of any single caller: a caller that stops waiting does not cancel it for the
//! others. As soon as the fetch resolves its key is released, so the next fetch starts over.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::scope::TaskScope;
use crate::utils::CallOnDrop;

type ComputationChannel<T> = Shared<oneshot::Receiver<Result<T, Error>>>;

/// The table of running fetches, keyed by `K`, each resolving to a `T`.
pub struct InFlight<K, T> {
    name: Arc<str>,
    scope: Arc<TaskScope>,
    computations: Arc<DashMap<K, ComputationChannel<T>>>,
}

impl<K, T> Clone for InFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            scope: Arc::clone(&self.scope),
            computations: Arc::clone(&self.computations),
        }
    }
}

impl<K: Hash + Eq, T> fmt::Debug for InFlight<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("name", &self.name)
            .field("pending", &self.computations.len())
            .finish()
    }
}

impl<K, T> InFlight<K, T>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty table whose fetches run in `scope`.
    pub fn new(name: impl Into<Arc<str>>, scope: Arc<TaskScope>) -> Self {
        Self {
            name: name.into(),
            scope,
            computations: Arc::default(),
        }
    }

    /// The name of this table, used in log messages and metric tags.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of keys with a running fetch.
    pub fn len(&self) -> usize {
        self.computations.len()
    }

    /// Whether no fetch is running.
    pub fn is_empty(&self) -> bool {
        self.computations.is_empty()
    }

    /// Whether a fetch for `key` is running.
    pub fn is_pending(&self, key: &K) -> bool {
        self.computations.contains_key(key)
    }

    /// Fetches `key` with `loader`, or joins the fetch of `key` that is already running.
    ///
    /// `loader` is only invoked if there is no running fetch and the scope accepts work. It
    /// must not call back into this table. The fetch is started before this returns, the returned future merely
    /// waits for its result. Dropping it stops waiting without affecting the fetch.
    ///
    /// Every waiter of one fetch receives the same result. A failure of `loader` turns into
    /// [`Error::LoadFailure`], a scope shutdown into [`Error::Cancelled`].
    pub fn fetch<F, Fut, E>(&self, key: K, loader: F) -> BoxFuture<'static, Result<T, Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        if !self.scope.is_ready() {
            return future::ready(Err(Error::NotReady)).boxed();
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        let running = match self.computations.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(channel.clone());
                None
            }
        };

        if let Some(running) = running {
            metric!(counter("inflight.hit") += 1, "table" => &self.name);
            tracing::trace!(table = %self.name, ?key, "Joining running fetch");
            return Self::wait_for(running);
        }
        metric!(counter("inflight.miss") += 1, "table" => &self.name);

        // The entry is ours now. Nothing may hold the table's lock from here on, as the guard
        // below could be dropped right away if the task never gets to run.
        let remove_computation_token = CallOnDrop::new({
            let computations = Arc::clone(&self.computations);
            let key = key.clone();
            move || {
                computations.remove(&key);
            }
        });

        let computation = loader();
        let table = Arc::clone(&self.name);
        let sink = Arc::clone(self.scope.error_sink());
        let task = async move {
            let start = Instant::now();
            let result = match AssertUnwindSafe(computation).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => {
                    let error = Error::load_failure(&key, error.into());
                    tracing::debug!(table = %table, ?key, "Fetch failed: {error}");
                    Err(error)
                }
                Err(payload) => {
                    let task = format!("inflight.{table}");
                    let message = sink.report_panic(&task, payload.as_ref());
                    Err(Error::Panicked { task, message })
                }
            };
            metric!(timer("inflight.duration") = start.elapsed(), "table" => &table);

            // Drop the token first to evict from the table. This ensures that callers either
            // get a channel that will receive data, or they start a new computation.
            drop(remove_computation_token);
            sender.send(result).ok();
        };

        let task_name = format!("inflight.{}", self.name);
        if let Err(error) = self.scope.spawn_with_result(&task_name, task) {
            return future::ready(Err(error)).boxed();
        }

        Self::wait_for(channel)
    }

    fn wait_for(channel: ComputationChannel<T>) -> BoxFuture<'static, Result<T, Error>> {
        channel
            .map(|received| received.unwrap_or(Err(Error::Cancelled)))
            .boxed()
    }
}
