//! The asynchronous data-access core.
//!
//! All asynchronous work is spawned through a [`TaskScope`](scope::TaskScope). On top of
//! it, [`InFlight`](inflight::InFlight) collapses concurrent requests for the same key into
//! one fetch, and the [`bridge`] turns any unit of work into a [`CompletionHandle`] for
//! callers that cannot `.await`. [`RecordService`](services::RecordService) composes these
//! with the caches from `stockpile-cache` over an external [`Storage`](storage::Storage).

#[macro_use]
pub mod metrics;

pub mod bridge;
pub mod config;
pub mod dispatch;
mod error;
pub mod inflight;
pub mod logging;
pub mod scope;
pub mod services;
pub mod storage;
mod utils;

pub use bridge::{CompletionHandle, Outcome};
pub use error::{Error, SharedError};
