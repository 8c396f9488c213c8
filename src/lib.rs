#![forbid(unsafe_code)]
//! Umbrella crate re-exporting the arbor memory arbitration subsystem.

pub use arbor_core as core;
pub use arbor_mem as mem;

pub use arbor_core::{ArbitratorKind, MemoryAllocator, MemoryConfig};
pub use arbor_mem::{
    MemoryManager, MemoryPool, MemoryReclaimer, MemoryReservation, ManagerOptions,
    TrackingAllocator,
};
