//! Statistics tracking for the local proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic request counters, logged and reset periodically.
pub struct Stats {
    pub requests: AtomicU64,
    pub direct: AtomicU64,
    pub relayed: AtomicU64,
    pub failed: AtomicU64,
    /// Cumulative dial time in microseconds for averaging.
    total_dial_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            direct: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_dial_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_direct(&self, dial_time: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.direct.fetch_add(1, Ordering::Relaxed);
        self.add_dial_time(dial_time);
    }

    pub fn record_relayed(&self, dial_time: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.relayed.fetch_add(1, Ordering::Relaxed);
        self.add_dial_time(dial_time);
    }

    /// A request that ended with an error response.
    pub fn record_failed(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn add_dial_time(&self, dial_time: Duration) {
        self.total_dial_time_us
            .fetch_add(dial_time.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let direct = self.direct.swap(0, Ordering::Relaxed);
        let relayed = self.relayed.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total_us = self.total_dial_time_us.swap(0, Ordering::Relaxed);

        let dialed = direct + relayed;
        let avg_dial_ms = if dialed > 0 {
            (total_us as f64 / dialed as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            direct,
            relayed,
            failed,
            avg_dial_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub direct: u64,
    pub relayed: u64,
    pub failed: u64,
    pub avg_dial_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages_dial_time_and_resets() {
        let stats = Stats::new();
        stats.record_direct(Duration::from_millis(2));
        stats.record_relayed(Duration::from_millis(4));
        stats.record_failed();

        let snap = stats.snapshot_and_reset();

        assert_eq!(snap.requests, 3);
        assert_eq!(snap.direct, 1);
        assert_eq!(snap.relayed, 1);
        assert_eq!(snap.failed, 1);
        assert!((snap.avg_dial_ms - 3.0).abs() < 1e-9);

        let empty = stats.snapshot_and_reset();
        assert_eq!(empty.requests, 0);
        assert_eq!(empty.avg_dial_ms, 0.0);
    }
}
