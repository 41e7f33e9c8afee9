//! Node configuration.

use std::time::Duration;

/// Tunables shared by the routing table, the lookup engine and the store protocol.
///
/// Override individual fields with struct update syntax:
///
/// ```
/// use kadstore::Config;
///
/// let config = Config {
///     k: 8,
///     ..Default::default()
/// };
/// assert_eq!(config.replication_target(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket size, also the size of the closest set a lookup converges on.
    pub k: usize,
    /// The number of concurrent requests per lookup round.
    pub alpha: usize,
    /// How long a single request may take before it counts as a failure.
    pub request_timeout: Duration,
    /// Hard cap on the number of rounds a lookup or store may run.
    pub max_rounds: usize,
    /// Sleep between rounds that had nobody left to query.
    pub round_backoff: Duration,
    /// The number of storage confirmations after which a store stops, defaults to `k`.
    pub replication_target: Option<usize>,
    /// The number of replicas a value lookup collects copies from before it stops, a local copy
    /// included.
    pub read_quorum: usize,
    /// Records whose share of deleted copies exceeds this ratio are dropped from lookups.
    pub delete_threshold: f64,
    /// Width of the time buckets records are keyed by, in seconds.
    pub time_bucket: u64,
    /// The number of times a pending operation is retried before it is dropped.
    pub max_retries: u32,
    /// Interval between retries of pending operations.
    pub retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            request_timeout: Duration::from_secs(5),
            max_rounds: 32,
            round_backoff: Duration::from_millis(50),
            replication_target: None,
            read_quorum: 3,
            delete_threshold: 0.5,
            time_bucket: 3600,
            max_retries: 5,
            retry_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Returns the number of confirmations a store or delete aims for.
    pub fn replication_target(&self) -> usize {
        self.replication_target.unwrap_or(self.k).max(1)
    }
}

/// Returns `true` if `count` is a strict majority of `total`.
pub fn is_majority(count: usize, total: usize) -> bool {
    count * 2 > total
}
