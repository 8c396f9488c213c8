#![forbid(unsafe_code)]
//! arbor-mem: hierarchical memory pools and capacity arbitration.
//!
//! This crate provides the concrete subsystem behind the capability
//! interfaces in `arbor-core`: a process-wide [`MemoryManager`] owning a
//! tree of [`MemoryPool`]s, a pluggable [`MemoryArbitrator`] that divides
//! the global budget among pools, and the [`MemoryReclaimer`] hook the
//! arbitrator invokes to free memory under pressure.
//!
//! Growth requests that cannot be satisfied are backpressure, not errors;
//! callers spill, retry, or abort. The one deliberate panic is the
//! shutdown leak check.

pub mod allocator;
pub mod arbitrator;
pub mod error;
pub mod manager;
pub mod pool;
pub mod reclaim;
pub mod tracking;

pub use allocator::TrackingAllocator;
pub use arbitrator::{
    ArbitrationStateCheck, ArbitratorConfig, ArbitratorStats, MemoryArbitrator,
};
pub use error::{Error, Result};
pub use manager::{
    initialize, instance, testing_clear_instance, testing_set_instance, ManagerOptions,
    MemoryManager, DEFAULT_ROOT_NAME,
};
pub use pool::{CapacityAuthority, MemoryPool, MemoryReservation, PoolKind, PoolOptions};
pub use reclaim::MemoryReclaimer;
