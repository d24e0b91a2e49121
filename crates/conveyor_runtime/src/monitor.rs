//! Runner metrics.
//!
//! Each runner owns a [`RunnerMetrics`] of lock-free counters; snapshots are
//! merged per stage group into [`PipelineMetrics`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one runner
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    fetched: AtomicU64,
    processed: AtomicU64,
    empty: AtomicU64,
    failed: AtomicU64,
    forwarded: AtomicU64,
    acknowledged: AtomicU64,
}

impl RunnerMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fetched task
    pub fn record_fetch(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful `process` call; `produced` is false for `Ok(None)`
    pub fn record_processed(&self, produced: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if !produced {
            self.empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a failed or panicked `process` call
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a result enqueued downstream
    pub fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acknowledgement sent back to the source
    pub fn record_ack(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
        }
    }
}

/// Copy of runner counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Tasks fetched from the source
    pub fetched: u64,
    /// `process` calls that returned `Ok`
    pub processed: u64,
    /// `process` calls that returned `Ok(None)`
    pub empty: u64,
    /// `process` calls that failed or panicked
    pub failed: u64,
    /// Results enqueued downstream
    pub forwarded: u64,
    /// Acknowledgements sent to the source
    pub acknowledged: u64,
}

impl MetricsSnapshot {
    /// Add another snapshot's counters into this one
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        self.fetched += other.fetched;
        self.processed += other.processed;
        self.empty += other.empty;
        self.failed += other.failed;
        self.forwarded += other.forwarded;
        self.acknowledged += other.acknowledged;
    }

    /// Fetched but not yet acknowledged
    #[must_use]
    pub const fn in_flight(&self) -> u64 {
        self.fetched.saturating_sub(self.acknowledged)
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed + self.failed;
        if attempted == 0 {
            return 1.0;
        }
        self.processed as f64 / attempted as f64
    }
}

/// Aggregated counters for a composed pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineMetrics {
    /// Sum over first-stage runners
    pub processors: MetricsSnapshot,
    /// Sum over second-stage runners
    pub output_handlers: MetricsSnapshot,
    /// Items waiting in the intermediate queue, if there is one
    pub queue_depth: Option<usize>,
    /// Intermediate queue fill ratio; always 0.0 when unbounded
    pub queue_fill: Option<f64>,
}
