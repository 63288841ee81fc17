use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A mix of record reads and writes against simulated storage.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Workload {
    /// The number of operations in flight at any time.
    pub concurrency: usize,
    /// The number of distinct records. Keys are drawn uniformly from `0..keys`.
    pub keys: u32,
    /// The delay of every storage operation.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The probability of a storage operation failing.
    pub failure_rate: f64,
    /// The fraction of operations that write instead of read.
    pub write_ratio: f64,
    /// The cache to use, as named in the `caches` section of the config.
    pub cache: String,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            concurrency: 16,
            keys: 1_000,
            latency: Duration::from_millis(20),
            failure_rate: 0.0,
            write_ratio: 0.0,
            cache: "players".into(),
        }
    }
}
