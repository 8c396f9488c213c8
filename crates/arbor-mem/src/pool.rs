//! Hierarchical memory pools.
//!
//! A pool is a named node in the memory-consumer tree. Leaf pools are the
//! unit call sites reserve against; aggregate pools only roll up usage and
//! capacity of their subtree. Granted capacity is enforced at the root of
//! each tree; when a reservation overflows the root's grant, the root asks
//! its capacity authority (the manager) for growth and treats a refusal as
//! backpressure.
//!
//! Ownership is bottom-up: callers own their pools, a child keeps its
//! parent alive, and a parent tracks children through non-owning handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, warn};

use arbor_core::bytes::{align_up, fmt_bytes};

use crate::error::{Error, Result};
use crate::reclaim::MemoryReclaimer;
use crate::tracking::PeakTracker;

/// Growth retries after a successful arbitration before giving up; bounds
/// livelock when other threads keep consuming freshly granted capacity.
const MAX_GROWTH_ATTEMPTS: usize = 8;

/// Capacity authority a root pool reports to.
///
/// This is the manager's surface as seen from a pool: growth requests on
/// reservation overflow, and a destruction notification when the last
/// reference to a registered root is released.
pub trait CapacityAuthority: Send + Sync {
    /// Ask for `increment_bytes` more granted capacity on `pool`. `Ok(false)`
    /// is backpressure, not an error.
    fn request_growth(&self, pool: &MemoryPool, increment_bytes: u64) -> Result<bool>;

    /// Called from the pool's destructor; removes the registry entry and
    /// returns the pool's capacity to the arbitrator.
    fn notify_destroyed(&self, pool: &MemoryPool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Root or internal node; aggregates its subtree, cannot reserve.
    Aggregate,
    /// The unit of reservation; cannot have children.
    Leaf,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Aggregate => write!(f, "AGGREGATE"),
            PoolKind::Leaf => write!(f, "LEAF"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Reservation sizes are rounded up to this alignment.
    pub alignment: u64,
    /// Ceiling this pool may ever be grown to.
    pub max_capacity: u64,
    /// When false, reservations are not accounted (system pools may opt out).
    pub track_usage: bool,
    /// Leaf pools flagged not thread-safe rely on external synchronization
    /// by their single caller; counters stay atomic either way.
    pub thread_safe: bool,
    pub debug_enabled: bool,
    /// Abort instead of returning `CapacityExceeded`, so a core dump
    /// preserves the failing state for postmortem debugging.
    pub core_on_allocation_failure: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            alignment: arbor_core::bytes::MIN_ALIGNMENT_BYTES,
            max_capacity: arbor_core::bytes::MAX_MEMORY_BYTES,
            track_usage: true,
            thread_safe: true,
            debug_enabled: false,
            core_on_allocation_failure: false,
        }
    }
}

pub struct MemoryPool {
    name: String,
    kind: PoolKind,
    parent: Option<Arc<MemoryPool>>,
    options: PoolOptions,
    /// Capacity currently allocated to this pool by the arbitrator.
    /// Meaningful at tree roots; children draw from their root's grant.
    granted: AtomicU64,
    /// Bytes reserved under this node (leaf charges roll up to here).
    used: AtomicU64,
    /// Serializes `used`/`granted` read-modify-writes at tree roots so a
    /// shrink can never pull the grant below concurrent usage. Readers
    /// stay lock-free; never held across calls out of the pool.
    capacity_lock: Mutex<()>,
    peak: PeakTracker,
    children: Mutex<HashMap<String, Weak<MemoryPool>>>,
    reclaimer: Option<Box<dyn MemoryReclaimer>>,
    authority: Weak<dyn CapacityAuthority>,
    /// Only registered root pools report their destruction.
    notify_on_destroy: bool,
}

impl MemoryPool {
    pub(crate) fn new(
        name: String,
        kind: PoolKind,
        parent: Option<Arc<MemoryPool>>,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
        authority: Weak<dyn CapacityAuthority>,
        notify_on_destroy: bool,
        options: PoolOptions,
    ) -> Arc<MemoryPool> {
        Arc::new(MemoryPool {
            name,
            kind,
            parent,
            options,
            granted: AtomicU64::new(0),
            used: AtomicU64::new(0),
            capacity_lock: Mutex::new(()),
            peak: PeakTracker::new(),
            children: Mutex::new(HashMap::new()),
            reclaimer,
            authority,
            notify_on_destroy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == PoolKind::Leaf
    }

    pub fn parent(&self) -> Option<&Arc<MemoryPool>> {
        self.parent.as_ref()
    }

    pub fn max_capacity(&self) -> u64 {
        self.options.max_capacity
    }

    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Acquire)
    }

    /// Bytes reserved under this node right now.
    pub fn current_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak.peak()
    }

    /// Granted capacity not currently backing reservations.
    pub fn free_bytes(&self) -> u64 {
        self.granted().saturating_sub(self.current_bytes())
    }

    pub fn has_reclaimer(&self) -> bool {
        self.reclaimer.is_some()
    }

    pub fn thread_safe(&self) -> bool {
        self.options.thread_safe
    }

    pub fn child_count(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The enforcement point for this pool's tree.
    pub fn root(&self) -> &MemoryPool {
        let mut cur = self;
        while let Some(parent) = cur.parent.as_deref() {
            cur = parent;
        }
        cur
    }

    // ---- children ----

    /// Add a leaf child. Fails on non-aggregate pools and duplicate sibling
    /// names (a dead child of the same name is replaced, not rejected).
    pub fn add_leaf_child(
        self: &Arc<Self>,
        name: &str,
        thread_safe: bool,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        self.add_child(name, PoolKind::Leaf, thread_safe, reclaimer)
    }

    /// Add an aggregate child for a subtree that subdivides further.
    pub fn add_aggregate_child(
        self: &Arc<Self>,
        name: &str,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        self.add_child(name, PoolKind::Aggregate, true, reclaimer)
    }

    fn add_child(
        self: &Arc<Self>,
        name: &str,
        kind: PoolKind,
        thread_safe: bool,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        if self.kind != PoolKind::Aggregate {
            return Err(Error::UnsupportedOp {
                pool: self.name.clone(),
                op: "add_child",
            });
        }
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = children.get(name) {
            if existing.upgrade().is_some() {
                return Err(Error::DuplicatePool(name.to_string()));
            }
        }
        let child = MemoryPool::new(
            name.to_string(),
            kind,
            Some(Arc::clone(self)),
            reclaimer,
            self.authority.clone(),
            false,
            PoolOptions {
                alignment: self.options.alignment,
                // Children draw from the root's grant; they carry no
                // independent ceiling.
                max_capacity: arbor_core::bytes::MAX_MEMORY_BYTES,
                track_usage: self.options.track_usage,
                thread_safe,
                debug_enabled: self.options.debug_enabled,
                core_on_allocation_failure: self.options.core_on_allocation_failure,
            },
        );
        children.insert(name.to_string(), Arc::downgrade(&child));
        Ok(child)
    }

    fn remove_child(&self, name: &str) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.remove(name);
    }

    /// Live children, in no particular order.
    pub fn children(&self) -> Vec<Arc<MemoryPool>> {
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.values().filter_map(Weak::upgrade).collect()
    }

    // ---- usage accounting ----

    /// Reserve `bytes` against this leaf, growing the root's grant through
    /// the capacity authority if needed. Either the whole aligned request
    /// is charged or nothing is.
    pub fn try_reserve(&self, bytes: u64) -> Result<()> {
        if self.kind != PoolKind::Leaf {
            return Err(Error::UnsupportedOp {
                pool: self.name.clone(),
                op: "reserve",
            });
        }
        if !self.options.track_usage || bytes == 0 {
            return Ok(());
        }
        let size = align_up(bytes, self.options.alignment);
        self.root().charge_with_growth(size)?;
        // Root is charged; the rest of the chain is advisory rollup.
        let mut cur = self;
        while let Some(parent) = cur.parent.as_deref() {
            let next = cur.used.fetch_add(size, Ordering::AcqRel) + size;
            cur.peak.record_used(next);
            cur = parent;
        }
        Ok(())
    }

    /// RAII form of `try_reserve`; the reservation releases on drop.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<MemoryReservation> {
        self.try_reserve(bytes)?;
        let charged = if self.options.track_usage && self.kind == PoolKind::Leaf {
            align_up(bytes, self.options.alignment)
        } else {
            0
        };
        Ok(MemoryReservation {
            pool: Arc::clone(self),
            bytes: charged,
        })
    }

    /// Return `bytes` previously reserved through `try_reserve`.
    pub fn release(&self, bytes: u64) {
        if self.kind != PoolKind::Leaf || !self.options.track_usage || bytes == 0 {
            return;
        }
        let size = align_up(bytes, self.options.alignment);
        let mut cur = self;
        loop {
            cur.release_local(size);
            match cur.parent.as_deref() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    fn release_local(&self, size: u64) {
        let prev = if self.parent.is_none() {
            let _guard = self.capacity_lock.lock().unwrap_or_else(|e| e.into_inner());
            let cur = self.used.load(Ordering::Relaxed);
            self.used.store(cur.saturating_sub(size), Ordering::Release);
            cur
        } else {
            self.used
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| {
                    Some(cur.saturating_sub(size))
                })
                .unwrap_or(0)
        };
        if prev < size {
            warn!(
                pool = %self.name,
                released = size,
                used = prev,
                "release exceeds reserved bytes"
            );
        }
    }

    /// One charge attempt under the capacity lock.
    fn try_charge(&self, size: u64) -> bool {
        let _guard = self.capacity_lock.lock().unwrap_or_else(|e| e.into_inner());
        let used = self.used.load(Ordering::Relaxed);
        let next = used.saturating_add(size);
        if next > self.granted.load(Ordering::Relaxed) {
            return false;
        }
        self.used.store(next, Ordering::Release);
        self.peak.record_used(next);
        true
    }

    /// Charge at the tree root, asking the authority for growth whenever
    /// the grant is short. All-or-nothing: a denied growth leaves the
    /// root's counter untouched. Growth is requested without holding the
    /// capacity lock; a freshly granted slice can be raced away by a
    /// concurrent arbitration, hence the bounded retry.
    fn charge_with_growth(&self, size: u64) -> Result<()> {
        let mut attempts = 0;
        loop {
            if self.try_charge(size) {
                return Ok(());
            }
            attempts += 1;
            if attempts > MAX_GROWTH_ATTEMPTS {
                return Err(self.capacity_exceeded(size));
            }
            let next = self.current_bytes().saturating_add(size);
            let shortfall = align_up(
                next.saturating_sub(self.granted()).max(1),
                self.options.alignment,
            );
            let authority = self
                .authority
                .upgrade()
                .ok_or_else(|| Error::AuthorityUnavailable(self.name.clone()))?;
            if !authority.request_growth(self, shortfall)? {
                return Err(self.capacity_exceeded(size));
            }
        }
    }

    fn capacity_exceeded(&self, requested: u64) -> Error {
        if self.options.core_on_allocation_failure {
            error!(
                pool = %self.name,
                requested,
                granted = self.granted(),
                used = self.current_bytes(),
                "aborting on capacity failure"
            );
            std::process::abort();
        }
        Error::CapacityExceeded {
            pool: self.name.clone(),
            requested,
            granted: self.granted(),
            used: self.current_bytes(),
        }
    }

    // ---- capacity ops (arbitrator side) ----

    /// Raise the grant by `bytes`; returns the new grant.
    pub(crate) fn grow_granted(&self, bytes: u64) -> u64 {
        let _guard = self.capacity_lock.lock().unwrap_or_else(|e| e.into_inner());
        let next = self.granted.load(Ordering::Relaxed).saturating_add(bytes);
        self.granted.store(next, Ordering::Release);
        next
    }

    /// Take up to `target` bytes of spare grant (never below current usage).
    /// `target == 0` means take all spare capacity. Returns the bytes taken.
    pub(crate) fn shrink_granted(&self, target: u64) -> u64 {
        let _guard = self.capacity_lock.lock().unwrap_or_else(|e| e.into_inner());
        let granted = self.granted.load(Ordering::Relaxed);
        let used = self.used.load(Ordering::Relaxed);
        let spare = granted.saturating_sub(used);
        let delta = if target == 0 { spare } else { spare.min(target) };
        if delta == 0 {
            return 0;
        }
        self.granted.store(granted - delta, Ordering::Release);
        delta
    }

    /// Invoke this pool's reclaimer, if any.
    pub(crate) fn reclaim(&self, target_bytes: u64, wait_ms: u64) -> u64 {
        match &self.reclaimer {
            Some(reclaimer) => reclaimer.reclaim(self, target_bytes, wait_ms),
            None => 0,
        }
    }

    // ---- diagnostics ----

    /// One-line usage summary.
    pub fn usage_line(&self) -> String {
        format!(
            "{} [{}] granted {} used {} peak {} max {}",
            self.name,
            self.kind,
            fmt_bytes(self.granted()),
            fmt_bytes(self.current_bytes()),
            fmt_bytes(self.peak_bytes()),
            fmt_bytes(self.options.max_capacity),
        )
    }

    /// Indented dump of this subtree, children sorted by name.
    pub fn tree_usage(&self) -> String {
        let mut out = String::new();
        self.tree_usage_inner(0, &mut out);
        out
    }

    fn tree_usage_inner(&self, depth: usize, out: &mut String) {
        for _ in 0..=depth {
            out.push('\t');
        }
        out.push_str(&self.usage_line());
        out.push('\n');
        let mut children = self.children();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in children {
            child.tree_usage_inner(depth + 1, out);
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            parent.remove_child(&self.name);
        }
        if self.notify_on_destroy {
            // The manager may already be tearing down; a dead authority is
            // benign here.
            if let Some(authority) = self.authority.upgrade() {
                authority.notify_destroyed(self);
            }
        }
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("granted", &self.granted())
            .field("used", &self.current_bytes())
            .field("max_capacity", &self.options.max_capacity)
            .finish()
    }
}

/// RAII reservation against a leaf pool. Dropping it returns the bytes.
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    bytes: u64,
}

impl MemoryReservation {
    /// Aligned bytes currently held by this reservation.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Resize to `new_bytes` (aligned up). Growth may fail under
    /// backpressure, leaving the reservation unchanged; shrinking always
    /// succeeds.
    pub fn try_resize(&mut self, new_bytes: u64) -> Result<()> {
        let target = align_up(new_bytes, self.pool.options.alignment);
        if target == self.bytes {
            return Ok(());
        }
        if target < self.bytes {
            self.pool.release(self.bytes - target);
        } else {
            self.pool.try_reserve(target - self.bytes)?;
        }
        self.bytes = target;
        Ok(())
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.pool.release(self.bytes);
            self.bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct GrantAll;

    impl CapacityAuthority for GrantAll {
        fn request_growth(&self, pool: &MemoryPool, increment_bytes: u64) -> Result<bool> {
            pool.grow_granted(increment_bytes);
            Ok(true)
        }
        fn notify_destroyed(&self, _pool: &MemoryPool) {}
    }

    struct DenyAll;

    impl CapacityAuthority for DenyAll {
        fn request_growth(&self, _pool: &MemoryPool, _increment_bytes: u64) -> Result<bool> {
            Ok(false)
        }
        fn notify_destroyed(&self, _pool: &MemoryPool) {}
    }

    fn root_with_authority(
        authority: &Arc<dyn CapacityAuthority>,
        max_capacity: u64,
    ) -> Arc<MemoryPool> {
        MemoryPool::new(
            "root".to_string(),
            PoolKind::Aggregate,
            None,
            None,
            Arc::downgrade(authority),
            false,
            PoolOptions {
                max_capacity,
                alignment: 64,
                ..PoolOptions::default()
            },
        )
    }

    #[test]
    fn reserve_charges_leaf_and_root() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        leaf.try_reserve(100).unwrap();
        // Aligned up to 128.
        assert_eq!(leaf.current_bytes(), 128);
        assert_eq!(root.current_bytes(), 128);
        assert!(root.granted() >= 128);

        leaf.release(100);
        assert_eq!(leaf.current_bytes(), 0);
        assert_eq!(root.current_bytes(), 0);
    }

    #[test]
    fn denied_growth_is_backpressure_with_no_partial_charge() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(DenyAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let err = leaf.try_reserve(4096).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert_eq!(leaf.current_bytes(), 0);
        assert_eq!(root.current_bytes(), 0);
        assert_eq!(root.granted(), 0);
    }

    #[test]
    fn reserve_on_aggregate_is_a_usage_error() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        assert!(matches!(
            root.try_reserve(64),
            Err(Error::UnsupportedOp { .. })
        ));
    }

    #[test]
    fn leaf_cannot_have_children() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();
        assert!(matches!(
            leaf.add_leaf_child("nested", true, None),
            Err(Error::UnsupportedOp { .. })
        ));
    }

    #[test]
    fn duplicate_sibling_name_rejected_until_destroyed() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("scratch", true, None).unwrap();
        assert!(matches!(
            root.add_leaf_child("scratch", true, None),
            Err(Error::DuplicatePool(_))
        ));
        drop(leaf);
        // Name is reusable once the previous child is gone.
        root.add_leaf_child("scratch", true, None).unwrap();
    }

    #[test]
    fn dropped_child_detaches_from_parent() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();
        assert_eq!(root.child_count(), 1);
        drop(leaf);
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn reservation_guard_releases_on_drop() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        {
            let reservation = leaf.reserve(1000).unwrap();
            assert_eq!(reservation.bytes(), align_up(1000, 64));
            assert_eq!(root.current_bytes(), reservation.bytes());
        }
        assert_eq!(root.current_bytes(), 0);
    }

    #[test]
    fn reservation_resize_grows_and_shrinks() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let mut reservation = leaf.reserve(128).unwrap();
        reservation.try_resize(512).unwrap();
        assert_eq!(leaf.current_bytes(), 512);
        reservation.try_resize(64).unwrap();
        assert_eq!(leaf.current_bytes(), 64);
        drop(reservation);
        assert_eq!(leaf.current_bytes(), 0);
    }

    #[test]
    fn shrink_granted_never_goes_below_usage() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();
        leaf.try_reserve(256).unwrap();

        let granted = root.granted();
        let spare = granted - root.current_bytes();
        assert_eq!(root.shrink_granted(0), spare);
        assert_eq!(root.granted(), root.current_bytes());
        assert_eq!(root.shrink_granted(0), 0);
        leaf.release(256);
    }

    #[test]
    fn tree_usage_lists_subtree() {
        let authority: Arc<dyn CapacityAuthority> = Arc::new(GrantAll);
        let root = root_with_authority(&authority, 1 << 20);
        let _a = root.add_leaf_child("a", true, None).unwrap();
        let _b = root.add_leaf_child("b", true, None).unwrap();
        let dump = root.tree_usage();
        assert!(dump.contains("root [AGGREGATE]"));
        assert!(dump.contains("a [LEAF]"));
        assert!(dump.contains("b [LEAF]"));
    }
}
