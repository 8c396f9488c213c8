//! Capacity arbitration strategies.
//!
//! The arbitrator owns the arbitrable budget and decides how it is divided
//! among root pools over time. Whatever the strategy, the protocol is
//! fixed: direct commit when free capacity suffices, then bounded
//! reclamation from sibling pools, then failure. A request is granted in
//! full or not at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use arbor_core::bytes::fmt_bytes;
use arbor_core::ArbitratorKind;

use crate::pool::MemoryPool;

/// Polled during long arbitration waits; return `false` to cancel the
/// waiting request (e.g. the query was cancelled). Advisory only:
/// reclamation calls already in flight are not preempted.
pub type ArbitrationStateCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ArbitratorConfig {
    pub kind: ArbitratorKind,
    /// The arbitrable budget; commitments never exceed this.
    pub capacity: u64,
    /// Largest capacity slice moved per reclaim step.
    pub transfer_bytes: u64,
    /// Max wall time one growth request may spend in the reclaim phase.
    pub reclaim_wait_ms: u64,
    pub state_check: Option<ArbitrationStateCheck>,
}

/// Monotonic counters, snapshotted via [`MemoryArbitrator::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArbitratorStats {
    pub num_requests: u64,
    pub num_granted: u64,
    pub num_denied: u64,
    pub num_cancelled: u64,
    /// Usage bytes freed by reclaimer invocations.
    pub reclaimed_bytes: u64,
    /// Capacity bytes taken back from pools.
    pub shrunk_bytes: u64,
}

/// Policy engine dividing the global budget among pools.
pub trait MemoryArbitrator: Send + Sync {
    fn kind(&self) -> ArbitratorKind;

    /// Total arbitrable capacity.
    fn capacity(&self) -> u64;

    /// Grow `pool` by exactly `bytes`, possibly reclaiming from
    /// `candidates` (the requester is skipped). `false` is backpressure.
    fn grow_capacity(&self, pool: &MemoryPool, candidates: &[Arc<MemoryPool>], bytes: u64)
        -> bool;

    /// Shrink across `pools` until `target_bytes` is reclaimed; `0` means
    /// release all spare capacity. Returns bytes actually reclaimed.
    fn shrink_capacity(&self, pools: &[Arc<MemoryPool>], target_bytes: u64) -> u64;

    /// Single-pool shrink; drop-time release is the `target_bytes == 0` case.
    fn shrink_pool(&self, pool: &MemoryPool, target_bytes: u64) -> u64;

    fn stats(&self) -> ArbitratorStats;

    /// One-line state dump for diagnostics.
    fn describe(&self) -> String;
}

/// Build the arbitrator selected by `config.kind`.
pub fn create(config: ArbitratorConfig) -> Box<dyn MemoryArbitrator> {
    match config.kind {
        ArbitratorKind::NoOp => Box::new(NoOpArbitrator::new(config)),
        ArbitratorKind::Shared => Box::new(SharedArbitrator::new(config)),
    }
}

#[derive(Default)]
struct StatCounters {
    num_requests: AtomicU64,
    num_granted: AtomicU64,
    num_denied: AtomicU64,
    num_cancelled: AtomicU64,
    reclaimed_bytes: AtomicU64,
    shrunk_bytes: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ArbitratorStats {
        ArbitratorStats {
            num_requests: self.num_requests.load(Ordering::Relaxed),
            num_granted: self.num_granted.load(Ordering::Relaxed),
            num_denied: self.num_denied.load(Ordering::Relaxed),
            num_cancelled: self.num_cancelled.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
            shrunk_bytes: self.shrunk_bytes.load(Ordering::Relaxed),
        }
    }
}

// ---- shared strategy ----

struct SharedState {
    /// Capacity not committed to any pool.
    free_capacity: u64,
}

/// Arbitrates a shared budget: commitments are drawn from a free pool and
/// returned to it on shrink; under pressure, spare and reclaimable
/// capacity is pulled from sibling pools in transfer-sized steps.
///
/// Arbitrations are serialized under one lock; reclaimers run
/// synchronously inside it, which makes `grow_capacity` the documented
/// blocking point of the subsystem.
pub struct SharedArbitrator {
    capacity: u64,
    transfer_bytes: u64,
    reclaim_wait_ms: u64,
    state_check: Option<ArbitrationStateCheck>,
    state: Mutex<SharedState>,
    counters: StatCounters,
}

impl SharedArbitrator {
    fn new(config: ArbitratorConfig) -> Self {
        Self {
            capacity: config.capacity,
            transfer_bytes: config.transfer_bytes.max(1),
            reclaim_wait_ms: config.reclaim_wait_ms,
            state_check: config.state_check,
            state: Mutex::new(SharedState {
                free_capacity: config.capacity,
            }),
            counters: StatCounters::default(),
        }
    }

    fn cancelled(&self) -> bool {
        match &self.state_check {
            Some(check) => !check(),
            None => false,
        }
    }

    fn free_capacity(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_capacity
    }

    /// Pull spare (granted but unused) capacity from `candidates` into the
    /// free pool until `needed` is covered. Returns the bytes pulled.
    fn take_spare_capacity(&self, candidates: &[&Arc<MemoryPool>], mut needed: u64) -> u64 {
        let mut taken = 0u64;
        let mut ordered: Vec<&Arc<MemoryPool>> = candidates.to_vec();
        ordered.sort_by_key(|c| std::cmp::Reverse(c.free_bytes()));
        'candidates: for candidate in ordered {
            while needed > 0 {
                if self.cancelled() {
                    break 'candidates;
                }
                let step = needed.min(self.transfer_bytes);
                let got = candidate.shrink_granted(step);
                if got == 0 {
                    continue 'candidates;
                }
                taken += got;
                needed = needed.saturating_sub(got);
            }
            break;
        }
        taken
    }

    /// Invoke reclaimers on `candidates` until `needed` is covered or the
    /// deadline passes. Returns the capacity pulled into the free pool.
    fn reclaim_capacity(
        &self,
        candidates: &[&Arc<MemoryPool>],
        mut needed: u64,
        deadline: Instant,
    ) -> u64 {
        let mut taken = 0u64;
        let mut ordered: Vec<&Arc<MemoryPool>> = candidates
            .iter()
            .filter(|c| c.has_reclaimer())
            .copied()
            .collect();
        ordered.sort_by_key(|c| std::cmp::Reverse(c.current_bytes()));
        'candidates: for candidate in ordered {
            loop {
                if needed == 0 || self.cancelled() {
                    break 'candidates;
                }
                let now = Instant::now();
                if now >= deadline {
                    break 'candidates;
                }
                let remaining_ms = deadline.saturating_duration_since(now).as_millis() as u64;
                let step = needed.min(self.transfer_bytes);
                let freed_usage = candidate.reclaim(step, remaining_ms);
                self.counters
                    .reclaimed_bytes
                    .fetch_add(freed_usage, Ordering::Relaxed);
                let got = candidate.shrink_granted(step);
                if freed_usage == 0 && got == 0 {
                    continue 'candidates;
                }
                taken += got;
                needed = needed.saturating_sub(got);
                trace!(
                    pool = candidate.name(),
                    freed_usage,
                    capacity_taken = got,
                    "reclaim step"
                );
            }
        }
        taken
    }
}

impl MemoryArbitrator for SharedArbitrator {
    fn kind(&self) -> ArbitratorKind {
        ArbitratorKind::Shared
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn grow_capacity(
        &self,
        pool: &MemoryPool,
        candidates: &[Arc<MemoryPool>],
        bytes: u64,
    ) -> bool {
        self.counters.num_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancelled() {
            self.counters.num_cancelled.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // The pool's own ceiling binds before the global budget; granted
        // capacity only moves under this lock, so the read is stable.
        if pool.granted().saturating_add(bytes) > pool.max_capacity() {
            self.counters.num_denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                pool = pool.name(),
                bytes,
                max_capacity = pool.max_capacity(),
                "growth denied at pool max capacity"
            );
            return false;
        }
        if state.free_capacity < bytes {
            let others: Vec<&Arc<MemoryPool>> = candidates
                .iter()
                .filter(|c| !std::ptr::eq(c.as_ref(), pool))
                .collect();
            let needed = bytes - state.free_capacity;
            let spare = self.take_spare_capacity(&others, needed);
            self.counters
                .shrunk_bytes
                .fetch_add(spare, Ordering::Relaxed);
            state.free_capacity += spare;

            if state.free_capacity < bytes {
                let deadline = Instant::now() + Duration::from_millis(self.reclaim_wait_ms);
                let needed = bytes - state.free_capacity;
                let reclaimed = self.reclaim_capacity(&others, needed, deadline);
                self.counters
                    .shrunk_bytes
                    .fetch_add(reclaimed, Ordering::Relaxed);
                state.free_capacity += reclaimed;
            }
        }
        // A cancellation observed mid-reclaim aborts the request even if
        // enough capacity was freed; the freed capacity stays in the free
        // pool, so no commitment leaks.
        if self.cancelled() {
            self.counters.num_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(pool = pool.name(), bytes, "arbitration cancelled");
            return false;
        }
        if state.free_capacity >= bytes {
            state.free_capacity -= bytes;
            pool.grow_granted(bytes);
            self.counters.num_granted.fetch_add(1, Ordering::Relaxed);
            trace!(pool = pool.name(), bytes, "capacity granted");
            true
        } else {
            self.counters.num_denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                pool = pool.name(),
                bytes,
                free = state.free_capacity,
                "capacity denied"
            );
            false
        }
    }

    fn shrink_capacity(&self, pools: &[Arc<MemoryPool>], target_bytes: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut freed = 0u64;
        if target_bytes == 0 {
            for pool in pools {
                freed += pool.shrink_granted(0);
            }
        } else {
            for pool in pools {
                if freed >= target_bytes {
                    break;
                }
                freed += pool.shrink_granted(target_bytes - freed);
            }
            let deadline = Instant::now() + Duration::from_millis(self.reclaim_wait_ms);
            for pool in pools {
                if freed >= target_bytes {
                    break;
                }
                if !pool.has_reclaimer() {
                    continue;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let needed = target_bytes - freed;
                let remaining_ms = deadline.saturating_duration_since(now).as_millis() as u64;
                let freed_usage = pool.reclaim(needed, remaining_ms);
                self.counters
                    .reclaimed_bytes
                    .fetch_add(freed_usage, Ordering::Relaxed);
                freed += pool.shrink_granted(needed);
            }
        }
        state.free_capacity = state.free_capacity.saturating_add(freed).min(self.capacity);
        self.counters.shrunk_bytes.fetch_add(freed, Ordering::Relaxed);
        debug!(target_bytes, freed, "shrink pass");
        freed
    }

    fn shrink_pool(&self, pool: &MemoryPool, target_bytes: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let freed = pool.shrink_granted(target_bytes);
        state.free_capacity = state.free_capacity.saturating_add(freed).min(self.capacity);
        self.counters.shrunk_bytes.fetch_add(freed, Ordering::Relaxed);
        freed
    }

    fn stats(&self) -> ArbitratorStats {
        self.counters.snapshot()
    }

    fn describe(&self) -> String {
        format!(
            "SharedArbitrator[capacity {} free {} transfer {} reclaimWaitMs {}]",
            fmt_bytes(self.capacity),
            fmt_bytes(self.free_capacity()),
            fmt_bytes(self.transfer_bytes),
            self.reclaim_wait_ms
        )
    }
}

// ---- no-op strategy ----

/// No global accounting: growth is granted directly up to the pool's own
/// max capacity. For deployments that cap pools individually and never
/// arbitrate between them.
pub struct NoOpArbitrator {
    capacity: u64,
    counters: StatCounters,
}

impl NoOpArbitrator {
    fn new(config: ArbitratorConfig) -> Self {
        Self {
            capacity: config.capacity,
            counters: StatCounters::default(),
        }
    }
}

impl MemoryArbitrator for NoOpArbitrator {
    fn kind(&self) -> ArbitratorKind {
        ArbitratorKind::NoOp
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn grow_capacity(
        &self,
        pool: &MemoryPool,
        _candidates: &[Arc<MemoryPool>],
        bytes: u64,
    ) -> bool {
        self.counters.num_requests.fetch_add(1, Ordering::Relaxed);
        if pool.granted().saturating_add(bytes) > pool.max_capacity() {
            self.counters.num_denied.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        pool.grow_granted(bytes);
        self.counters.num_granted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn shrink_capacity(&self, pools: &[Arc<MemoryPool>], target_bytes: u64) -> u64 {
        let mut freed = 0u64;
        for pool in pools {
            if target_bytes != 0 && freed >= target_bytes {
                break;
            }
            let remaining = if target_bytes == 0 {
                0
            } else {
                target_bytes - freed
            };
            freed += pool.shrink_granted(remaining);
        }
        self.counters.shrunk_bytes.fetch_add(freed, Ordering::Relaxed);
        freed
    }

    fn shrink_pool(&self, pool: &MemoryPool, target_bytes: u64) -> u64 {
        let freed = pool.shrink_granted(target_bytes);
        self.counters.shrunk_bytes.fetch_add(freed, Ordering::Relaxed);
        freed
    }

    fn stats(&self) -> ArbitratorStats {
        self.counters.snapshot()
    }

    fn describe(&self) -> String {
        format!("NoOpArbitrator[capacity {}]", fmt_bytes(self.capacity))
    }
}
