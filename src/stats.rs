//! Attempt counters for periodic logging.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters accumulated between snapshots.
pub struct FetchStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub doh_resolutions: AtomicU64,
    pub records_applied: AtomicU64,
    pub windows_expired: AtomicU64,
    pub windows_masked: AtomicU64,
    /// Cumulative attempt time in milliseconds for averaging.
    total_attempt_ms: AtomicU64,
}

impl FetchStats {
    pub fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            doh_resolutions: AtomicU64::new(0),
            records_applied: AtomicU64::new(0),
            windows_expired: AtomicU64::new(0),
            windows_masked: AtomicU64::new(0),
            total_attempt_ms: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, elapsed_ms: u64, applied: usize, used_doh: bool) {
        self.record_attempt(elapsed_ms, used_doh);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.records_applied.fetch_add(applied as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed_ms: u64, used_doh: bool) {
        self.record_attempt(elapsed_ms, used_doh);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_expired(&self) {
        self.windows_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_masked(&self) {
        self.windows_masked.fetch_add(1, Ordering::Relaxed);
    }

    fn record_attempt(&self, elapsed_ms: u64, used_doh: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.total_attempt_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        if used_doh {
            self.doh_resolutions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot_and_reset(&self) -> FetchStatsSnapshot {
        let attempts = self.attempts.swap(0, Ordering::Relaxed);
        let successes = self.successes.swap(0, Ordering::Relaxed);
        let failures = self.failures.swap(0, Ordering::Relaxed);
        let doh_resolutions = self.doh_resolutions.swap(0, Ordering::Relaxed);
        let records_applied = self.records_applied.swap(0, Ordering::Relaxed);
        let windows_expired = self.windows_expired.swap(0, Ordering::Relaxed);
        let windows_masked = self.windows_masked.swap(0, Ordering::Relaxed);
        let total_ms = self.total_attempt_ms.swap(0, Ordering::Relaxed);

        let avg_attempt_ms = if attempts > 0 {
            total_ms as f64 / attempts as f64
        } else {
            0.0
        };

        FetchStatsSnapshot {
            attempts,
            successes,
            failures,
            doh_resolutions,
            records_applied,
            windows_expired,
            windows_masked,
            avg_attempt_ms,
        }
    }
}

impl Default for FetchStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub doh_resolutions: u64,
    pub records_applied: u64,
    pub windows_expired: u64,
    pub windows_masked: u64,
    pub avg_attempt_ms: f64,
}
