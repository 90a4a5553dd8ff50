//! Tuning configuration for the metabase core.
//!
//! Mirrors the teacher's `Config` presets (`production()` / `balanced()` /
//! `benchmark()`): a plain struct of documented knobs plus a handful of
//! named constructors, rather than a builder.
//!
//! # Example
//!
//! ```
//! use metabase::Config;
//!
//! let config = Config::default();
//! let mut tuned = Config::low_latency();
//! tuned.listing_batch_floor = 50;
//! ```

use std::time::Duration;

/// Tuning configuration shared by all adapters and the listing engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default time-to-live for a pending object's zombie-deletion deadline
    /// when the caller does not supply one (spec §4.4: 24h).
    pub default_zombie_deadline: Duration,

    /// Maximum number of multipart parts accepted by `CommitObject`.
    pub max_parts: u32,

    /// Minimum total plain size of any non-terminal multipart part.
    pub min_part_size: u64,

    /// Floor for the listing engine's per-batch row fetch size; the actual
    /// batch size starts at `limit + 1` and grows toward this multiplied by
    /// small constants as version/prefix collapsing consumes rows.
    pub listing_batch_floor: usize,

    /// Heuristic named in spec §9 Open Questions: extra entries fetched
    /// per batch to amortize `IsLatest` computation across collapsed
    /// versions. Any value >= 1 is correct; larger trades memory for fewer
    /// round trips.
    pub extra_entries_for_is_latest: usize,

    /// Consecutive skipped (non-`all_versions`) rows before the listing
    /// engine abandons the batch and requeries past the key.
    pub version_skip_requery: usize,

    /// Flat addend to the requery safety counter (`limit + N`); spec §9
    /// Open Questions flags this as workload-tunable.
    pub requery_safety_margin: usize,

    /// Maximum number of concurrent transactions an adapter will admit
    /// before returning `InvalidRequest`.
    pub max_concurrent_transactions: usize,

    /// CockroachDB `max_commit_delay` hint (distributed adapter only); `None`
    /// disables commit batching.
    pub max_commit_delay: Option<Duration>,

    /// Maximum number of automatic retries for a retriable transaction
    /// closure on the distributed adapter.
    pub max_transaction_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::balanced()
    }
}

impl Config {
    /// Balanced defaults suitable for most deployments.
    pub fn balanced() -> Self {
        Self {
            default_zombie_deadline: Duration::from_secs(24 * 60 * 60),
            max_parts: 10_000,
            min_part_size: 5 * 1024 * 1024,
            listing_batch_floor: 200,
            extra_entries_for_is_latest: 3,
            version_skip_requery: 20,
            requery_safety_margin: 10,
            max_concurrent_transactions: 1000,
            max_commit_delay: Some(Duration::from_millis(50)),
            max_transaction_retries: 5,
        }
    }

    /// Favors fewer round trips per request over batching; good for
    /// interactive / low-traffic deployments where latency matters more
    /// than aggregate throughput.
    pub fn low_latency() -> Self {
        let mut c = Self::balanced();
        c.listing_batch_floor = 50;
        c.max_commit_delay = None;
        c.max_transaction_retries = 2;
        c
    }

    /// Favors aggregate throughput: larger listing batches and commit-delay
    /// batching enabled on the distributed adapter.
    pub fn high_throughput() -> Self {
        let mut c = Self::balanced();
        c.listing_batch_floor = 1000;
        c.max_commit_delay = Some(Duration::from_millis(100));
        c.max_transaction_retries = 10;
        c
    }
}
