//! Router and executor counters.
//!
//! [`RouterMetricsStorage`] lives inside the router and the dispatcher and is
//! updated lock-free. [`RouterMetrics`] is the point-in-time copy handed to
//! callers. Counters are monotonic; delta calculation is the caller's job.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct RouterMetricsStorage {
    pub(crate) requests_total: AtomicU64,
    pub(crate) requests_failed: AtomicU64,
    pub(crate) driver_inits_started: AtomicU64,
    pub(crate) driver_inits_failed: AtomicU64,
    pub(crate) executor_invocations: AtomicU64,
    pub(crate) executor_failures: AtomicU64,
    pub(crate) executor_timeouts: AtomicU64,
}

impl RouterMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self, failed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_driver_init(&self, failed: bool) {
        self.driver_inits_started.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.driver_inits_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `timed_out` implies `failed`.
    pub(crate) fn record_invocation(&self, failed: bool, timed_out: bool) {
        self.executor_invocations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.executor_failures.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.executor_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RouterMetrics {
        RouterMetrics {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            driver_inits_started: self.driver_inits_started.load(Ordering::Relaxed),
            driver_inits_failed: self.driver_inits_failed.load(Ordering::Relaxed),
            executor_invocations: self.executor_invocations.load(Ordering::Relaxed),
            executor_failures: self.executor_failures.load(Ordering::Relaxed),
            executor_timeouts: self.executor_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub driver_inits_started: u64,
    pub driver_inits_failed: u64,
    pub executor_invocations: u64,
    pub executor_failures: u64,
    pub executor_timeouts: u64,
}
