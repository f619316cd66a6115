//! Check counters
//!
//! Lock-free counters over check outcomes and evaluation time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// External authorization metrics
#[derive(Debug, Default)]
pub struct ExtAuthMetrics {
    /// Total check requests
    pub requests_total: AtomicU64,
    /// Allowed requests
    pub allowed_total: AtomicU64,
    /// Denied requests (pipeline verdicts)
    pub denied_total: AtomicU64,
    /// Requests for hosts with no configuration
    pub not_found_total: AtomicU64,
    /// Requests rejected before evaluation (invalid input)
    pub errors_total: AtomicU64,
    /// Requests that ran out of time
    pub timeouts_total: AtomicU64,
    /// Total pipeline evaluation time in microseconds
    pub evaluation_time_us_total: AtomicU64,
}

impl ExtAuthMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allowed request
    pub fn record_allowed(&self, evaluation_time: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.allowed_total.fetch_add(1, Ordering::Relaxed);
        self.add_time(evaluation_time);
    }

    /// Record a denied request
    pub fn record_denied(&self, evaluation_time: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.denied_total.fetch_add(1, Ordering::Relaxed);
        self.add_time(evaluation_time);
    }

    /// Record a request whose evaluation deadline expired
    pub fn record_timeout(&self, evaluation_time: Duration) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
        self.record_denied(evaluation_time);
    }

    /// Record a request for an unknown host
    pub fn record_not_found(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.not_found_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that could not be evaluated
    pub fn record_error(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    fn add_time(&self, evaluation_time: Duration) {
        self.evaluation_time_us_total
            .fetch_add(evaluation_time.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn allowed(&self) -> u64 {
        self.allowed_total.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied_total.load(Ordering::Relaxed)
    }

    pub fn not_found(&self) -> u64 {
        self.not_found_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts_total.load(Ordering::Relaxed)
    }

    /// Average pipeline evaluation time in microseconds
    pub fn avg_evaluation_time_us(&self) -> u64 {
        let total = self.evaluation_time_us_total.load(Ordering::Relaxed);
        let count = self.allowed() + self.denied();
        if count > 0 {
            total / count
        } else {
            0
        }
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
