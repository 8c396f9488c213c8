//! Lightweight peak-usage tracking.
//!
//! Keep this cheap; it sits on the reservation hot path of every pool.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PeakTracker {
    peak_bytes: AtomicU64,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self {
            peak_bytes: AtomicU64::new(0),
        }
    }

    /// Record a new "used bytes" value; the peak only ever moves up.
    pub fn record_used(&self, used_bytes: u64) {
        self.peak_bytes.fetch_max(used_bytes, Ordering::AcqRel);
    }

    pub fn peak(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_only_moves_up() {
        let tracker = PeakTracker::new();
        tracker.record_used(100);
        tracker.record_used(40);
        assert_eq!(tracker.peak(), 100);
        tracker.record_used(250);
        assert_eq!(tracker.peak(), 250);
    }
}
