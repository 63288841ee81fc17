//! Caching primitives for the data-access core.
//!
//! These primitives can be composed and layered on top of each other.
//!
//! Currently there is a [`LoadingCache`] which knows how to compute missing values itself
//! through a [`CacheLoader`], and a [`ManualCache`] which is handed a loader on every call.
//! Both share the same eviction semantics: a fixed time-to-live after write, combined with
//! a maximum entry count that evicts the least recently used entries first.
//!
//! Neither cache deduplicates concurrent misses for the same key. Callers that need this
//! compose the caches with an in-flight request table.

#![warn(missing_docs)]

mod loading;
mod manual;
mod settings;
mod stats;
mod store;

pub use loading::*;
pub use manual::*;
pub use settings::*;
pub use stats::*;
