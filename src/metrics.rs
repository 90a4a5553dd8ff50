//! Operation counters and histograms.
//!
//! The teacher tracks performance counters in a plain `PerformanceMetrics`
//! struct (`db/metrics.rs`) mutated under `&mut self`. The facade here is
//! shared across concurrently-running operations (spec §5: "Operations are
//! thread-safe and reentrant"), so counters are `AtomicU64` instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running sum/count pair approximating a histogram's mean, in the absence
/// of a full metrics backend.
#[derive(Debug, Default)]
pub struct RunningStat {
    sum: AtomicU64,
    count: AtomicU64,
}

impl RunningStat {
    fn new() -> Self {
        Self::default()
    }

    /// Records one observation.
    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations recorded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean of all recorded observations, or `0.0` if none were recorded.
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

/// Counters and histograms for metabase operations (spec §6).
#[derive(Debug, Default)]
pub struct Metrics {
    /// `BeginObjectNextVersion` / `TestingBeginObjectExactVersion` calls.
    pub object_begin: AtomicU64,
    /// `CommitObject` / `CommitInlineObject` calls that succeeded.
    pub object_commit: AtomicU64,
    /// `BeginSegment` calls.
    pub segment_begin: AtomicU64,
    /// `CommitSegment` / `CommitInlineSegment` calls that succeeded.
    pub segment_commit: AtomicU64,
    /// `UpdateSegmentPieces` calls that succeeded.
    pub segment_update: AtomicU64,
    /// Distribution of segment counts observed by `CommitObject`.
    pub object_commit_segments: RunningStat,
    /// Distribution of total encrypted size observed by `CommitObject`.
    pub object_commit_encrypted_size: RunningStat,
}

impl Metrics {
    /// Creates a fresh, zeroed set of counters.
    pub fn new() -> Self {
        Self {
            object_commit_segments: RunningStat::new(),
            object_commit_encrypted_size: RunningStat::new(),
            ..Default::default()
        }
    }

    /// Snapshot of all counters, useful for logging or a status endpoint.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            object_begin: self.object_begin.load(Ordering::Relaxed),
            object_commit: self.object_commit.load(Ordering::Relaxed),
            segment_begin: self.segment_begin.load(Ordering::Relaxed),
            segment_commit: self.segment_commit.load(Ordering::Relaxed),
            segment_update: self.segment_update.load(Ordering::Relaxed),
            mean_commit_segments: self.object_commit_segments.mean(),
            mean_commit_encrypted_size: self.object_commit_encrypted_size.mean(),
        }
    }
}

/// Point-in-time snapshot of [`Metrics`], safe to serialize or log.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    /// See [`Metrics::object_begin`].
    pub object_begin: u64,
    /// See [`Metrics::object_commit`].
    pub object_commit: u64,
    /// See [`Metrics::segment_begin`].
    pub segment_begin: u64,
    /// See [`Metrics::segment_commit`].
    pub segment_commit: u64,
    /// See [`Metrics::segment_update`].
    pub segment_update: u64,
    /// Mean of [`Metrics::object_commit_segments`].
    pub mean_commit_segments: f64,
    /// Mean of [`Metrics::object_commit_encrypted_size`].
    pub mean_commit_encrypted_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_stat_mean() {
        let stat = RunningStat::new();
        assert_eq!(stat.mean(), 0.0);
        stat.observe(10);
        stat.observe(20);
        assert_eq!(stat.count(), 2);
        assert_eq!(stat.mean(), 15.0);
    }

    #[test]
    fn metrics_snapshot_reflects_counters() {
        let metrics = Metrics::new();
        metrics.object_begin.fetch_add(3, Ordering::Relaxed);
        metrics.object_commit_segments.observe(4);
        metrics.object_commit_segments.observe(6);
        let snap = metrics.snapshot();
        assert_eq!(snap.object_begin, 3);
        assert_eq!(snap.mean_commit_segments, 5.0);
    }
}
