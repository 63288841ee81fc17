//! The supervised lifetime of all asynchronous work.
//!
//! A [`TaskScope`] starts out uninitialized, becomes ready on [`initialize`](TaskScope::initialize)
//! and is terminated for good by [`shutdown`](TaskScope::shutdown). Work can only be spawned
//! while it is ready. A failing or panicking unit of work is reported to the scope's
//! [`ErrorSink`] and never affects any sibling.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ScopeConfig;
use crate::error::Error;
use crate::utils::panic_message;

/// Receives the failures of spawned work that nobody else observes.
///
/// Every failure is logged at error level, which also forwards it to Sentry, and counted.
#[derive(Debug, Default)]
pub struct ErrorSink {
    failures: AtomicU64,
}

impl ErrorSink {
    /// Reports a unit of work that returned an error.
    pub fn report(&self, task: &str, error: &anyhow::Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metric!(counter("scope.task.failed") += 1, "task" => task);
        tracing::error!(task, "Uncaught failure in spawned task: {error:?}");
    }

    /// Reports a unit of work that panicked, and returns the panic message.
    pub fn report_panic(&self, task: &str, payload: &(dyn Any + Send)) -> String {
        let message = panic_message(payload);
        self.failures.fetch_add(1, Ordering::Relaxed);
        metric!(counter("scope.task.failed") += 1, "task" => task);
        tracing::error!(task, "Spawned task panicked: {message}");
        message
    }

    /// The number of failures reported so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
struct Supervisor {
    token: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Debug)]
enum ScopeState {
    Uninitialized,
    Ready(Supervisor),
    Terminated,
}

/// A supervised scope for spawned work.
///
/// Cloning is not needed, share it behind an [`Arc`].
#[derive(Debug)]
pub struct TaskScope {
    runtime: Handle,
    config: ScopeConfig,
    state: Mutex<ScopeState>,
    sink: Arc<ErrorSink>,
}

impl TaskScope {
    /// Creates a new, uninitialized scope spawning onto `runtime`.
    pub fn new(runtime: Handle, config: ScopeConfig) -> Self {
        Self {
            runtime,
            config,
            state: Mutex::new(ScopeState::Uninitialized),
            sink: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the scope ready to accept work.
    ///
    /// Calling this on a ready scope does nothing. A scope that was shut down stays terminated.
    pub fn initialize(&self) {
        let mut state = self.state();
        match *state {
            ScopeState::Uninitialized => {
                *state = ScopeState::Ready(Supervisor {
                    token: CancellationToken::new(),
                    tracker: TaskTracker::new(),
                });
                tracing::info!("Task scope initialized");
            }
            ScopeState::Ready(_) => {}
            ScopeState::Terminated => {
                tracing::warn!("Task scope was shut down already and cannot be initialized again");
            }
        }
    }

    /// Whether work can currently be spawned.
    pub fn is_ready(&self) -> bool {
        matches!(*self.state(), ScopeState::Ready(_))
    }

    /// The sink receiving failures of spawned work.
    pub fn error_sink(&self) -> &Arc<ErrorSink> {
        &self.sink
    }

    /// The number of failures reported to the error sink so far.
    pub fn failure_count(&self) -> u64 {
        self.sink.failure_count()
    }

    fn supervisor(&self) -> Result<Supervisor, Error> {
        match &*self.state() {
            ScopeState::Ready(supervisor) => Ok(supervisor.clone()),
            _ => Err(Error::NotReady),
        }
    }

    /// Cancels all outstanding work and waits for it to wind down.
    ///
    /// The wait is bounded by the configured `shutdown_timeout`, work still running after that
    /// is abandoned. Calling this more than once, or on a scope that was never initialized,
    /// does nothing.
    pub async fn shutdown(&self) {
        let supervisor = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, ScopeState::Terminated) {
                ScopeState::Ready(supervisor) => supervisor,
                previous => {
                    *state = previous;
                    return;
                }
            }
        };

        tracing::info!(tasks = supervisor.tracker.len(), "Shutting down task scope");
        supervisor.token.cancel();
        supervisor.tracker.close();

        let timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(timeout, supervisor.tracker.wait()).await {
            Ok(()) => tracing::info!("Task scope shut down"),
            Err(_) => {
                let abandoned = supervisor.tracker.len();
                metric!(gauge("scope.shutdown.abandoned") = abandoned as u64);
                tracing::warn!(
                    abandoned,
                    ?timeout,
                    "Task scope shutdown timed out, abandoning outstanding tasks"
                );
            }
        }
    }

    /// Blocking version of [`shutdown`](Self::shutdown), for callers outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn shutdown_blocking(&self) {
        self.runtime.block_on(self.shutdown());
    }

    /// Spawns `work` on the runtime, cancelled when the scope shuts down.
    fn supervise<F>(&self, supervisor: &Supervisor, work: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = supervisor.token.clone();
        let task = async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = work => Some(output),
            }
        };
        supervisor.tracker.spawn_on(task, &self.runtime)
    }

    /// Spawns a fire-and-forget unit of work.
    ///
    /// An error returned by `work`, or a panic, goes to the [`ErrorSink`]. The returned handle
    /// resolves once the work has finished, whether it failed or not.
    pub fn spawn<F>(&self, name: &str, work: F) -> Result<TaskHandle<()>, Error>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        let task = name.to_owned();
        self.spawn_with_result(name, async move {
            if let Err(error) = work.await {
                sink.report(&task, &error);
            }
        })
    }

    /// Spawns a unit of work producing a value.
    ///
    /// A panic is reported to the [`ErrorSink`] and turns into [`Error::Panicked`] for the
    /// awaiting caller.
    pub fn spawn_with_result<F>(&self, name: &str, work: F) -> Result<TaskHandle<F::Output>, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let supervisor = self.supervisor()?;

        let task: Arc<str> = name.into();
        let sink = Arc::clone(&self.sink);
        let reported = Arc::clone(&task);
        let work = async move {
            AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .map_err(|payload| sink.report_panic(&reported, payload.as_ref()))
        };

        let inner = self.supervise(&supervisor, work);
        Ok(TaskHandle { task, inner })
    }
}

/// A handle to a unit of work spawned through a [`TaskScope`].
///
/// Dropping the handle detaches the work, it keeps running.
#[derive(Debug)]
pub struct TaskHandle<T> {
    task: Arc<str>,
    inner: JoinHandle<Option<Result<T, String>>>,
}

impl<T> TaskHandle<T> {
    /// The name the work was spawned with.
    pub fn name(&self) -> &str {
        &self.task
    }

    /// Cancels the work.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// A handle that cancels the work without awaiting it.
    pub fn abort_handle(&self) -> AbortHandle {
        self.inner.abort_handle()
    }

    /// Whether the work has finished.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let joined = std::task::ready!(Pin::new(&mut self.inner).poll(cx));
        Poll::Ready(match joined {
            Ok(Some(Ok(value))) => Ok(value),
            Ok(Some(Err(message))) => Err(Error::Panicked {
                task: self.task.to_string(),
                message,
            }),
            Ok(None) => Err(Error::Cancelled),
            Err(error) if error.is_cancelled() => Err(Error::Cancelled),
            Err(error) => Err(Error::Panicked {
                task: self.task.to_string(),
                message: error.to_string(),
            }),
        })
    }
}
