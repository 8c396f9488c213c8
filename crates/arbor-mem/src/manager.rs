//! Process-wide memory manager.
//!
//! Owns the global capacity, the allocator handle, the arbitrator, the
//! always-present default root pool (with its shared leaf array), and the
//! registry of externally created root pools. The registry holds weak
//! handles only: `Weak::upgrade` is the liveness check, so the registry
//! never extends a pool's lifetime and races with concurrent destruction
//! are benign.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::Lazy;
use tracing::{debug, error, warn};

use arbor_core::bytes::{fmt_bytes, MAX_MEMORY_BYTES, MIN_ALIGNMENT_BYTES};
use arbor_core::{MemoryAllocator, MemoryConfig};

use crate::arbitrator::{self, ArbitrationStateCheck, ArbitratorConfig, ArbitratorStats, MemoryArbitrator};
use crate::error::{Error, Result};
use crate::pool::{CapacityAuthority, MemoryPool, PoolKind, PoolOptions};
use crate::reclaim::MemoryReclaimer;

/// Root pool backing untracked system usage (e.g. spill scratch space).
pub const DEFAULT_ROOT_NAME: &str = "__default_root__";

/// Runtime construction options: the serializable config plus the handles
/// that cannot live in it.
pub struct ManagerOptions {
    pub config: MemoryConfig,
    pub allocator: Arc<dyn MemoryAllocator>,
    pub state_check: Option<ArbitrationStateCheck>,
}

impl ManagerOptions {
    pub fn new(config: MemoryConfig, allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            config,
            allocator,
            state_check: None,
        }
    }

    pub fn with_state_check(mut self, state_check: ArbitrationStateCheck) -> Self {
        self.state_check = Some(state_check);
        self
    }
}

struct ManagerInner {
    capacity: u64,
    alignment: u64,
    pool_init_capacity: u64,
    check_usage_leak: bool,
    debug_enabled: bool,
    core_on_allocation_failure: bool,
    allocator: Arc<dyn MemoryAllocator>,
    arbitrator: Box<dyn MemoryArbitrator>,
    default_root: Arc<MemoryPool>,
    /// Registered root pools by unique name; entries are non-owning.
    pools: RwLock<HashMap<String, Weak<MemoryPool>>>,
    next_root_id: AtomicU64,
    next_leaf_id: AtomicU64,
}

pub struct MemoryManager {
    inner: Arc<ManagerInner>,
    shared_leaf_pools: Vec<Arc<MemoryPool>>,
}

impl MemoryManager {
    /// Build a manager from validated options.
    ///
    /// Fails on an invalid config or when the allocator's capacity does
    /// not match the requested total capacity; the subsystem must not
    /// start in an inconsistent state.
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let ManagerOptions {
            config,
            allocator,
            state_check,
        } = options;
        config.validate()?;
        if allocator.capacity() != config.capacity_bytes {
            return Err(Error::AllocatorMismatch {
                allocator_capacity: allocator.capacity(),
                manager_capacity: config.capacity_bytes,
            });
        }
        let alignment = config.alignment_bytes.max(MIN_ALIGNMENT_BYTES);
        let arbitrator = arbitrator::create(ArbitratorConfig {
            kind: config.arbitrator_kind,
            capacity: config.arbitrator_capacity(),
            transfer_bytes: config.pool_transfer_capacity_bytes,
            reclaim_wait_ms: config.reclaim_wait_ms,
            state_check,
        });

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let authority: Weak<dyn CapacityAuthority> = weak.clone();
            let default_root = MemoryPool::new(
                DEFAULT_ROOT_NAME.to_string(),
                PoolKind::Aggregate,
                None,
                None,
                authority,
                false,
                PoolOptions {
                    alignment,
                    max_capacity: MAX_MEMORY_BYTES,
                    track_usage: config.track_default_usage,
                    thread_safe: true,
                    debug_enabled: config.debug_enabled,
                    core_on_allocation_failure: config.core_on_allocation_failure_enabled,
                },
            );
            ManagerInner {
                capacity: config.capacity_bytes,
                alignment,
                pool_init_capacity: config.pool_init_capacity_bytes,
                check_usage_leak: config.check_usage_leak,
                debug_enabled: config.debug_enabled,
                core_on_allocation_failure: config.core_on_allocation_failure_enabled,
                allocator,
                arbitrator,
                default_root,
                pools: RwLock::new(HashMap::new()),
                next_root_id: AtomicU64::new(0),
                next_leaf_id: AtomicU64::new(0),
            }
        });
        // The default root is not arbitrated; pre-grow it to its unlimited
        // ceiling so system usage never triggers growth requests.
        inner.default_root.grow_granted(MAX_MEMORY_BYTES);

        let num_shared = config.num_shared_leaf_pools.max(1);
        let mut shared_leaf_pools = Vec::with_capacity(num_shared);
        for i in 0..num_shared {
            shared_leaf_pools.push(inner.default_root.add_leaf_child(
                &format!("shared_leaf_pool_{i}"),
                true,
                None,
            )?);
        }
        debug!(
            capacity = %fmt_bytes(config.capacity_bytes),
            arbitrator = inner.arbitrator.describe(),
            num_shared,
            "memory manager constructed"
        );
        Ok(Self {
            inner,
            shared_leaf_pools,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    pub fn alignment(&self) -> u64 {
        self.inner.alignment
    }

    /// Bytes the external allocator currently has handed out.
    pub fn total_bytes(&self) -> u64 {
        self.inner.allocator.total_used_bytes()
    }

    pub fn arbitrator_stats(&self) -> ArbitratorStats {
        self.inner.arbitrator.stats()
    }

    /// Create and register a root pool. An empty name is synthesized from
    /// an atomic counter; a name colliding with a live pool fails. The new
    /// pool starts with zero granted capacity and is immediately grown to
    /// `min(pool_init_capacity, capacity)` on a best-effort basis.
    pub fn add_root_pool(
        &self,
        name: &str,
        capacity: u64,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> Result<Arc<MemoryPool>> {
        let inner = &self.inner;
        let pool_name = if name.is_empty() {
            format!(
                "root_pool_{}",
                inner.next_root_id.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            name.to_string()
        };
        let weak = Arc::downgrade(inner);
        let authority: Weak<dyn CapacityAuthority> = weak;

        let pool = {
            let mut pools = inner.pools.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = pools.get(&pool_name) {
                if existing.upgrade().is_some() {
                    return Err(Error::DuplicatePool(pool_name));
                }
            }
            let pool = MemoryPool::new(
                pool_name.clone(),
                PoolKind::Aggregate,
                None,
                reclaimer,
                authority,
                true,
                PoolOptions {
                    alignment: inner.alignment,
                    max_capacity: capacity,
                    track_usage: true,
                    thread_safe: true,
                    debug_enabled: inner.debug_enabled,
                    core_on_allocation_failure: inner.core_on_allocation_failure,
                },
            );
            pools.insert(pool_name.clone(), Arc::downgrade(&pool));
            pool
        };

        debug_assert_eq!(pool.granted(), 0);
        let init = inner.pool_init_capacity.min(capacity);
        if init > 0 && !inner.arbitrator.grow_capacity(&pool, &[], init) {
            // Best effort; the pool grows on demand once siblings shrink.
            warn!(pool = %pool_name, init, "initial capacity grant denied");
        }
        debug!(pool = %pool_name, capacity, "root pool registered");
        Ok(pool)
    }

    /// Create a leaf pool under the default root. Not individually
    /// registered; it is tracked only through the tree.
    pub fn add_leaf_pool(&self, name: &str, thread_safe: bool) -> Result<Arc<MemoryPool>> {
        let inner = &self.inner;
        let pool_name = if name.is_empty() {
            format!(
                "leaf_pool_{}",
                inner.next_leaf_id.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            name.to_string()
        };
        inner.default_root.add_leaf_child(&pool_name, thread_safe, None)
    }

    /// The shared leaf pool assigned to the calling thread.
    pub fn shared_leaf_pool(&self) -> &Arc<MemoryPool> {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        self.shared_leaf_pool_for(hasher.finish())
    }

    /// Deterministic shared-leaf lookup for an explicit caller identity.
    pub fn shared_leaf_pool_for(&self, identity: u64) -> &Arc<MemoryPool> {
        let idx = (identity % self.shared_leaf_pools.len() as u64) as usize;
        &self.shared_leaf_pools[idx]
    }

    /// Grow `pool`'s granted capacity by `increment_bytes` through the
    /// arbitrator. `Ok(false)` is backpressure. Growing a pool already at
    /// the unlimited ceiling is a usage error.
    pub fn grow_pool(&self, pool: &MemoryPool, increment_bytes: u64) -> Result<bool> {
        self.inner.grow_pool(pool, increment_bytes)
    }

    /// Global-pressure hook: shrink across all live pools until
    /// `target_bytes` is reclaimed. Returns bytes actually reclaimed.
    pub fn shrink_pools(&self, target_bytes: u64) -> u64 {
        let alive = self.inner.alive_pools();
        self.inner.arbitrator.shrink_capacity(&alive, target_bytes)
    }

    /// Snapshot of the currently live registered root pools.
    pub fn alive_pools(&self) -> Vec<Arc<MemoryPool>> {
        self.inner.alive_pools()
    }

    /// Look up a live registered root pool by name.
    pub fn find_pool(&self, name: &str) -> Option<Arc<MemoryPool>> {
        let pools = self.inner.pools.read().unwrap_or_else(|e| e.into_inner());
        pools.get(name).and_then(Weak::upgrade)
    }

    /// Registered live roots plus every pool under the default root
    /// (shared leaves included).
    pub fn num_pools(&self) -> usize {
        self.inner.alive_pools().len() + self.inner.default_root.child_count()
    }

    /// Human-readable dump of the pool forest; `detail` switches between a
    /// flat name list and the full per-pool usage tree. Debugging aid, not
    /// a stable format.
    pub fn describe(&self, detail: bool) -> String {
        self.inner.describe(detail)
    }
}

impl ManagerInner {
    fn grow_pool(&self, pool: &MemoryPool, increment_bytes: u64) -> Result<bool> {
        if pool.granted() == MAX_MEMORY_BYTES {
            return Err(Error::UnsupportedOp {
                pool: pool.name().to_string(),
                op: "grow",
            });
        }
        let candidates = self.alive_pools();
        Ok(self
            .arbitrator
            .grow_capacity(pool, &candidates, increment_bytes))
    }

    fn drop_pool(&self, pool: &MemoryPool) {
        let removed = {
            let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
            pools.remove(pool.name())
        };
        if removed.is_none() {
            // A destruction notice for an unregistered pool is a lifecycle
            // bug in the caller.
            error!(pool = pool.name(), "dropped memory pool not found in registry");
            debug_assert!(
                false,
                "dropped memory pool '{}' not found in registry",
                pool.name()
            );
        }
        debug_assert_eq!(
            pool.current_bytes(),
            0,
            "pool '{}' destroyed with nonzero usage",
            pool.name()
        );
        let freed = self.arbitrator.shrink_pool(pool, 0);
        debug!(pool = pool.name(), freed, "root pool dropped");
    }

    fn alive_pools(&self) -> Vec<Arc<MemoryPool>> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools.values().filter_map(Weak::upgrade).collect()
    }

    fn describe(&self, detail: bool) -> String {
        let mut out = format!(
            "Memory Manager[capacity {} alignment {} usedBytes {} number of pools {}\n",
            fmt_bytes(self.capacity),
            fmt_bytes(self.alignment),
            fmt_bytes(self.allocator.total_used_bytes()),
            self.alive_pools().len() + self.default_root.child_count(),
        );
        out.push_str("List of root pools:\n");
        if detail {
            out.push_str(&self.default_root.tree_usage());
        } else {
            out.push_str(&format!("\t{}\n", self.default_root.name()));
        }
        let mut alive = self.alive_pools();
        alive.sort_by(|a, b| a.name().cmp(b.name()));
        for pool in alive {
            if detail {
                out.push_str(&pool.tree_usage());
            } else {
                out.push_str(&format!("\t{}\n", pool.name()));
            }
        }
        out.push_str(&self.allocator.describe());
        out.push('\n');
        out.push_str(&self.arbitrator.describe());
        out.push(']');
        out
    }
}

impl CapacityAuthority for ManagerInner {
    fn request_growth(&self, pool: &MemoryPool, increment_bytes: u64) -> Result<bool> {
        self.grow_pool(pool, increment_bytes)
    }

    fn notify_destroyed(&self, pool: &MemoryPool) {
        self.drop_pool(pool);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if !self.check_usage_leak || std::thread::panicking() {
            return;
        }
        let leaked: Vec<String> = {
            let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
            pools
                .iter()
                .filter(|(_, weak)| weak.upgrade().is_some())
                .map(|(name, _)| name.clone())
                .collect()
        };
        if !leaked.is_empty() {
            // A collaborator failed to release its pools; continuing would
            // hide the resource leak.
            panic!(
                "unexpected alive memory pools on manager destruction: {leaked:?}\n{}",
                self.describe(true)
            );
        }
    }
}

// ---- process-wide singleton ----

static INSTANCE: Lazy<Mutex<Option<Arc<MemoryManager>>>> = Lazy::new(|| Mutex::new(None));

/// Install the process-wide manager. Fails if one is already installed;
/// the strict initialize-once lifecycle is the only supported one.
pub fn initialize(options: ManagerOptions) -> Result<Arc<MemoryManager>> {
    let mut guard = INSTANCE.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let manager = Arc::new(MemoryManager::new(options)?);
    *guard = Some(Arc::clone(&manager));
    Ok(manager)
}

/// The process-wide manager; fails if `initialize` has not run.
pub fn instance() -> Result<Arc<MemoryManager>> {
    let guard = INSTANCE.lock().unwrap_or_else(|e| e.into_inner());
    guard.clone().ok_or(Error::NotInitialized)
}

/// Test-only: unconditionally replace the process-wide manager.
pub fn testing_set_instance(options: ManagerOptions) -> Result<Arc<MemoryManager>> {
    let manager = Arc::new(MemoryManager::new(options)?);
    let mut guard = INSTANCE.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(Arc::clone(&manager));
    Ok(manager)
}

/// Test-only: remove the process-wide manager so a later `initialize`
/// starts fresh.
pub fn testing_clear_instance() {
    let mut guard = INSTANCE.lock().unwrap_or_else(|e| e.into_inner());
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TrackingAllocator;

    const MIB: u64 = 1024 * 1024;

    fn test_options(capacity: u64, check_usage_leak: bool) -> ManagerOptions {
        let mut config = MemoryConfig::default();
        config.capacity_bytes = capacity;
        config.query_memory_capacity_bytes = capacity;
        config.pool_init_capacity_bytes = 64 * 1024;
        config.pool_transfer_capacity_bytes = 1024;
        config.alignment_bytes = 64;
        config.num_shared_leaf_pools = 4;
        config.check_usage_leak = check_usage_leak;
        ManagerOptions::new(config, Arc::new(TrackingAllocator::new(capacity)))
    }

    fn test_manager(capacity: u64) -> MemoryManager {
        MemoryManager::new(test_options(capacity, false)).unwrap()
    }

    #[test]
    fn construction_requires_matching_allocator_capacity() {
        let mut options = test_options(MIB, false);
        options.allocator = Arc::new(TrackingAllocator::new(2 * MIB));
        assert!(matches!(
            MemoryManager::new(options),
            Err(Error::AllocatorMismatch { .. })
        ));
    }

    #[test]
    fn construction_rejects_invalid_config() {
        let mut options = test_options(MIB, false);
        options.config.alignment_bytes = 48;
        assert!(matches!(MemoryManager::new(options), Err(Error::Config(_))));
    }

    #[test]
    fn root_pool_registration_and_lookup() {
        let manager = test_manager(MIB);
        let pool = manager.add_root_pool("q1", MIB, None).unwrap();
        assert_eq!(pool.name(), "q1");
        // Initial grant applied right after registration.
        assert_eq!(pool.granted(), 64 * 1024);
        assert!(manager.find_pool("q1").is_some());
        assert_eq!(manager.alive_pools().len(), 1);

        drop(pool);
        assert!(manager.find_pool("q1").is_none());
        assert!(manager.alive_pools().is_empty());
        // Name is reusable after destruction.
        manager.add_root_pool("q1", MIB, None).unwrap();
    }

    #[test]
    fn duplicate_root_pool_name_fails() {
        let manager = test_manager(MIB);
        let _pool = manager.add_root_pool("dup", MIB, None).unwrap();
        assert!(matches!(
            manager.add_root_pool("dup", MIB, None),
            Err(Error::DuplicatePool(_))
        ));
    }

    #[test]
    fn empty_names_are_synthesized_uniquely() {
        let manager = test_manager(MIB);
        let a = manager.add_root_pool("", MIB, None).unwrap();
        let b = manager.add_root_pool("", MIB, None).unwrap();
        assert_ne!(a.name(), b.name());
        let leaf = manager.add_leaf_pool("", true).unwrap();
        assert!(leaf.name().starts_with("leaf_pool_"));
    }

    #[test]
    fn leaf_pools_hang_off_the_default_root() {
        let manager = test_manager(MIB);
        let leaf = manager.add_leaf_pool("scratch", true).unwrap();
        assert!(leaf.is_leaf());
        assert_eq!(leaf.parent().unwrap().name(), DEFAULT_ROOT_NAME);
        // Not in the registry.
        assert!(manager.find_pool("scratch").is_none());
    }

    #[test]
    fn dropping_a_pool_returns_its_capacity() {
        let manager = test_manager(128 * 1024);
        // Initial grants: 64 KiB each exhausts the budget.
        let a = manager.add_root_pool("a", MIB, None).unwrap();
        let b = manager.add_root_pool("b", MIB, None).unwrap();
        assert_eq!(a.granted() + b.granted(), 128 * 1024);

        // Nothing left for c's initial grant.
        let c = manager.add_root_pool("c", MIB, None).unwrap();
        assert_eq!(c.granted(), 0);

        drop(a);
        // a's capacity is back in the free pool.
        assert!(manager.grow_pool(&c, 64 * 1024).unwrap());
        assert_eq!(c.granted(), 64 * 1024);
    }

    #[test]
    fn growing_an_unlimited_pool_is_a_usage_error() {
        let mut options = test_options(MIB, false);
        options.config.pool_init_capacity_bytes = MAX_MEMORY_BYTES;
        options.config.query_memory_capacity_bytes = MAX_MEMORY_BYTES;
        options.config.capacity_bytes = MAX_MEMORY_BYTES;
        options.allocator = Arc::new(TrackingAllocator::new(MAX_MEMORY_BYTES));
        let manager = MemoryManager::new(options).unwrap();
        let pool = manager
            .add_root_pool("sys", MAX_MEMORY_BYTES, None)
            .unwrap();
        assert_eq!(pool.granted(), MAX_MEMORY_BYTES);
        assert!(matches!(
            manager.grow_pool(&pool, 1),
            Err(Error::UnsupportedOp { .. })
        ));
    }

    #[test]
    fn shared_leaf_lookup_is_deterministic_by_identity() {
        let manager = test_manager(MIB);
        let a = manager.shared_leaf_pool_for(7);
        let b = manager.shared_leaf_pool_for(7);
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(
            manager.shared_leaf_pool_for(1).name(),
            manager.shared_leaf_pool_for(5).name()
        );
        assert_ne!(
            manager.shared_leaf_pool_for(1).name(),
            manager.shared_leaf_pool_for(2).name()
        );
        // The calling thread maps to some fixed slot.
        assert!(Arc::ptr_eq(
            manager.shared_leaf_pool(),
            manager.shared_leaf_pool()
        ));
    }

    #[test]
    fn num_pools_counts_registry_and_default_root_children() {
        let manager = test_manager(MIB);
        // 4 shared leaves from construction.
        assert_eq!(manager.num_pools(), 4);
        let _root = manager.add_root_pool("q", MIB, None).unwrap();
        let _leaf = manager.add_leaf_pool("l", true).unwrap();
        assert_eq!(manager.num_pools(), 6);
    }

    #[test]
    fn describe_lists_pools_flat_and_detailed() {
        let manager = test_manager(MIB);
        let _pool = manager.add_root_pool("q1", MIB, None).unwrap();
        let flat = manager.describe(false);
        assert!(flat.contains("List of root pools:"));
        assert!(flat.contains("\tq1\n"));
        let detailed = manager.describe(true);
        assert!(detailed.contains("q1 [AGGREGATE]"));
        assert!(detailed.contains("shared_leaf_pool_0 [LEAF]"));
    }

    #[test]
    #[should_panic(expected = "unexpected alive memory pools")]
    fn leak_check_panics_when_pools_outlive_the_manager() {
        let manager = MemoryManager::new(test_options(MIB, true)).unwrap();
        let pool = manager.add_root_pool("leaky", MIB, None).unwrap();
        drop(manager);
        drop(pool);
    }

    #[test]
    fn leak_check_passes_after_pools_are_released() {
        let manager = MemoryManager::new(test_options(MIB, true)).unwrap();
        let pool = manager.add_root_pool("tidy", MIB, None).unwrap();
        drop(pool);
        drop(manager);
    }

    #[test]
    fn singleton_lifecycle_is_strict() {
        testing_clear_instance();
        assert!(matches!(instance(), Err(Error::NotInitialized)));
        let manager = initialize(test_options(MIB, false)).unwrap();
        assert!(Arc::ptr_eq(&manager, &instance().unwrap()));
        assert!(matches!(
            initialize(test_options(MIB, false)),
            Err(Error::AlreadyInitialized)
        ));
        let replaced = testing_set_instance(test_options(MIB, false)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &instance().unwrap()));
        testing_clear_instance();
        assert!(matches!(instance(), Err(Error::NotInitialized)));
    }
}
