use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters behind the statistics stream.
///
/// Totals only grow; the stream derives windowed figures from deltas between
/// samples. `pending` and `in_flight` are gauges kept in step with request
/// state transitions.
#[derive(Default)]
pub(crate) struct StatsCollector {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StatsSample {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub in_flight: u64,
}

impl StatsCollector {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// A submitted request dropped before admission (blank input). It counts
    /// as submitted but reaches no terminal state.
    pub fn record_skipped(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: u64) {
        self.pending.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn sample(&self) -> StatsSample {
        StatsSample {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
