use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// An opaque failure that can be handed to many waiters at once.
pub type SharedError = Arc<anyhow::Error>;

/// Errors of the data-access core.
///
/// This error is [`Clone`], because the outcome of a single deduplicated fetch is delivered
/// to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The task scope was not initialized yet, or it was already shut down.
    #[error("task scope is not ready, it has to be initialized first")]
    NotReady,
    /// A loader or a storage read failed.
    ///
    /// Caches absorb this into an absent value; fetches propagate it to every waiter.
    #[error("failed to load {key}: {cause:#}")]
    LoadFailure {
        /// The debug representation of the key that failed to load.
        key: String,
        /// The original failure.
        cause: SharedError,
    },
    /// The work was cancelled, either explicitly or by the task scope shutting down.
    #[error("operation was cancelled")]
    Cancelled,
    /// A spawned unit of work panicked.
    #[error("task `{task}` panicked: {message}")]
    Panicked {
        /// The name of the task.
        task: String,
        /// The panic message.
        message: String,
    },
    /// A storage write failed.
    #[error("storage operation failed: {0:#}")]
    Storage(SharedError),
}

impl Error {
    pub(crate) fn load_failure(key: &impl fmt::Debug, cause: anyhow::Error) -> Self {
        Self::LoadFailure {
            key: format!("{key:?}"),
            cause: Arc::new(cause),
        }
    }

    pub(crate) fn storage(cause: anyhow::Error) -> Self {
        Self::Storage(Arc::new(cause))
    }

    /// Whether this is [`Cancelled`](Self::Cancelled).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The original failure of a [`LoadFailure`](Self::LoadFailure) or
    /// [`Storage`](Self::Storage) error.
    pub fn cause(&self) -> Option<&SharedError> {
        match self {
            Self::LoadFailure { cause, .. } | Self::Storage(cause) => Some(cause),
            _ => None,
        }
    }
}
