//! Completion handles for callers that cannot `.await`.
//!
//! A [`CompletionHandle`] observes a single unit of work from synchronous code: it can be
//! polled, waited on with or without a timeout, have callbacks attached, and be cancelled.
//! It resolves exactly once, to one of the three [`Outcome`]s.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Notify;

use crate::dispatch::Dispatch;
use crate::error::{Error, SharedError};
use crate::scope::TaskScope;

/// The final state of a [`CompletionHandle`].
#[derive(Clone, Debug)]
pub enum Outcome<T> {
    /// The work completed with a value.
    Completed(T),
    /// The work was cancelled before it completed.
    Cancelled,
    /// The work failed.
    Failed(SharedError),
}

impl<T> Outcome<T> {
    fn from_result(result: Result<T, anyhow::Error>) -> Self {
        let error = match result {
            Ok(value) => return Self::Completed(value),
            Err(error) => error,
        };
        match error.downcast_ref::<Error>() {
            Some(Error::Cancelled) => Self::Cancelled,
            Some(Error::LoadFailure { cause, .. }) => Self::Failed(Arc::clone(cause)),
            _ => Self::Failed(Arc::new(error)),
        }
    }

    /// Whether the work produced a value.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Whether the work was cancelled before it produced a value.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the work failed or panicked.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The value of a completed outcome.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct Slot<T> {
    outcome: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    resolved: Condvar,
    notify: Notify,
    cancelled_by_waiter: AtomicBool,
}

impl<T: Clone> Shared<T> {
    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `outcome` unless resolved already, and runs the pending callbacks.
    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut slot = self.slot();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.callbacks)
        };

        self.resolved.notify_all();
        self.notify.notify_waiters();
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }
}

/// The producing side of a [`CompletionHandle`].
///
/// Completing consumes it. Dropping it without completing resolves the handle as cancelled.
pub struct Completer<T: Clone> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Clone> Completer<T> {
    /// Resolves the handle with `outcome`.
    pub fn complete(mut self, outcome: Outcome<T>) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        // Losing the race against `CompletionHandle::cancel` is fine, anything else is a bug.
        let resolved =
            shared.resolve(outcome) || shared.cancelled_by_waiter.load(Ordering::Acquire);
        debug_assert!(resolved, "completion handle was resolved twice");
        if !resolved {
            tracing::error!("Completion handle was resolved twice");
        }
    }
}

impl<T: Clone> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Outcome::Cancelled);
        }
    }
}

impl<T: Clone> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("pending", &self.shared.is_some())
            .finish()
    }
}

/// Creates a connected [`Completer`] and [`CompletionHandle`].
pub fn completion_pair<T: Clone>() -> (Completer<T>, CompletionHandle<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            outcome: None,
            callbacks: Vec::new(),
        }),
        resolved: Condvar::new(),
        notify: Notify::new(),
        cancelled_by_waiter: AtomicBool::new(false),
    });
    let completer = Completer {
        shared: Some(Arc::clone(&shared)),
    };
    let handle = CompletionHandle {
        shared,
        task: None,
    };
    (completer, handle)
}

/// An observable handle to a unit of work.
///
/// Clones observe the same work.
pub struct CompletionHandle<T> {
    shared: Arc<Shared<T>>,
    task: Option<tokio::task::AbortHandle>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            task: self.task.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T: Clone> CompletionHandle<T> {
    /// Whether the handle has resolved.
    pub fn is_done(&self) -> bool {
        self.shared.slot().outcome.is_some()
    }

    /// The outcome, if the handle has resolved.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        self.shared.slot().outcome.clone()
    }

    /// Blocks the current thread until the handle resolves.
    ///
    /// This must not be called from within the runtime the work runs on.
    pub fn wait(&self) -> Outcome<T> {
        let mut slot = self.shared.slot();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            slot = self
                .shared
                .resolved
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks the current thread until the handle resolves or `timeout` elapses.
    ///
    /// Returns `None` on timeout. The work is not affected by that.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot();
        loop {
            if let Some(outcome) = &slot.outcome {
                return Some(outcome.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .shared
                .resolved
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Waits asynchronously until the handle resolves.
    pub async fn outcome(&self) -> Outcome<T> {
        loop {
            // registered before checking, so a concurrent resolve cannot be missed
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Runs `callback` with the outcome once the handle resolves.
    ///
    /// The callback runs on the resolving thread, or right away if the handle has resolved
    /// already.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.shared.slot();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(outcome);
    }

    /// Runs `callback` with the outcome on the execution context `context` of `dispatch`.
    pub fn on_complete_on<D, F>(&self, dispatch: Arc<D>, context: D::Context, callback: F)
    where
        D: Dispatch + 'static,
        F: FnOnce(Outcome<T>) + Send + 'static,
        T: Send + 'static,
    {
        self.on_complete(move |outcome| {
            dispatch.run_on(&context, Box::new(move || callback(outcome)));
        });
    }

    /// Cancels the work and resolves the handle as cancelled.
    ///
    /// Returns `false` if the handle had resolved already.
    pub fn cancel(&self) -> bool {
        self.shared.cancelled_by_waiter.store(true, Ordering::Release);
        let cancelled = self.shared.resolve(Outcome::Cancelled);
        if let Some(task) = &self.task {
            task.abort();
        }
        cancelled
    }
}

impl TaskScope {
    /// Runs `work` in this scope, observed through a [`CompletionHandle`].
    ///
    /// The handle completes with the value of `work`, or fails with its error. An
    /// [`Error::Cancelled`], a scope shutdown and [`CompletionHandle::cancel`] all resolve it as
    /// cancelled. A panic fails it and is reported to the scope's error sink.
    pub fn to_completion_handle<F, T, E>(
        &self,
        name: &str,
        work: F,
    ) -> Result<CompletionHandle<T>, Error>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Clone + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let (completer, mut handle) = completion_pair();

        let task = name.to_owned();
        let sink = Arc::clone(self.error_sink());
        let spawned = self.spawn_with_result(name, async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => Outcome::from_result(result.map_err(Into::into)),
                Err(payload) => {
                    let message = sink.report_panic(&task, payload.as_ref());
                    Outcome::Failed(Arc::new(Error::Panicked { task, message }.into()))
                }
            };
            completer.complete(outcome);
        })?;

        handle.task = Some(spawned.abort_handle());
        Ok(handle)
    }
}
