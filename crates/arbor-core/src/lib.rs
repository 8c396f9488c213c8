#![forbid(unsafe_code)]
//! arbor-core: capability traits and configuration for memory arbitration.
//!
//! The concrete manager, pools, and arbitration strategies live in
//! `arbor-mem`. We keep only the traits, the serializable configuration,
//! and small byte helpers here so any crate can depend on the API without
//! pulling in the arbitration logic.

pub mod alloc;
pub mod bytes;
pub mod config;
pub mod error;

pub use alloc::MemoryAllocator;
pub use bytes::{align_up, fmt_bytes, is_aligned, MAX_MEMORY_BYTES, MIN_ALIGNMENT_BYTES};
pub use config::{ArbitratorKind, MemoryConfig};
pub use error::{Error, Result};
