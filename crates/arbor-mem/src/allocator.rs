//! Counting allocator implementation of the `MemoryAllocator` capability.
//!
//! The subsystem never maps pages itself; production deployments inject
//! their own allocator handle. `TrackingAllocator` is the concrete
//! implementation used in tests and in deployments where the physical
//! allocator is managed elsewhere and only byte accounting is needed.

use std::sync::atomic::{AtomicU64, Ordering};

use arbor_core::bytes::fmt_bytes;
use arbor_core::MemoryAllocator;

pub struct TrackingAllocator {
    capacity: u64,
    used: AtomicU64,
}

impl TrackingAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Record `bytes` handed out. Returns false when the capacity would be
    /// exceeded; the counter is left unchanged in that case.
    pub fn record_allocated(&self, bytes: u64) -> bool {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Record `bytes` returned to the allocator.
    pub fn record_freed(&self, bytes: u64) {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(bytes);
            match self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }
}

impl MemoryAllocator for TrackingAllocator {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn total_used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        format!(
            "TrackingAllocator[capacity {} used {}]",
            fmt_bytes(self.capacity),
            fmt_bytes(self.total_used_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_and_down() {
        let alloc = TrackingAllocator::new(1024);
        assert!(alloc.record_allocated(512));
        assert!(alloc.record_allocated(512));
        assert!(!alloc.record_allocated(1));
        assert_eq!(alloc.total_used_bytes(), 1024);
        alloc.record_freed(1024);
        assert_eq!(alloc.total_used_bytes(), 0);
    }

    #[test]
    fn free_saturates_at_zero() {
        let alloc = TrackingAllocator::new(64);
        alloc.record_freed(128);
        assert_eq!(alloc.total_used_bytes(), 0);
    }
}
