use std::time::Duration;

use serde::Deserialize;

/// Construction parameters for a [`LoadingCache`](crate::LoadingCache) or
/// [`ManualCache`](crate::ManualCache).
///
/// All fields have defaults, so a config file only needs to mention the ones it changes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    /// Name of the cache, used in log messages and metric tags.
    pub name: String,

    /// How long an entry stays valid after it was written.
    ///
    /// An entry older than this is treated as absent on the next access, even if no
    /// maintenance sweep has removed it yet.
    ///
    /// Defaults to `5m`.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Duration,

    /// The maximum number of entries.
    ///
    /// Inserting beyond this evicts the least recently used entries.
    ///
    /// Defaults to `10_000`.
    pub max_capacity: u64,

    /// Whether hit, miss, load and eviction counters are recorded.
    pub record_stats: bool,
}

impl CacheSettings {
    /// Default settings with the given `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            name: "default".into(),
            time_to_live: Duration::from_secs(5 * 60),
            max_capacity: 10_000,
            record_stats: true,
        }
    }
}
