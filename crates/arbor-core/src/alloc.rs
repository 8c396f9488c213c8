//! Abstract allocator capability.
//!
//! The physical allocator (page mapping, mmap pools, and so on) lives
//! outside this subsystem. The manager depends on it only through this
//! narrow interface: a fixed capacity, a used-bytes gauge, and a
//! diagnostic description.

use crate::bytes::{is_aligned, MIN_ALIGNMENT_BYTES};
use crate::error::{Error, Result};

/// Capability handle for the external byte-level allocator.
///
/// Implementations must be cheap to query; both accessors are called on
/// diagnostic paths and at manager construction.
pub trait MemoryAllocator: Send + Sync {
    /// Total bytes this allocator may ever hand out.
    fn capacity(&self) -> u64;

    /// Bytes currently handed out (advisory; not a correctness API).
    fn total_used_bytes(&self) -> u64;

    /// One-line human-readable state dump for diagnostics.
    fn describe(&self) -> String;
}

/// Validate an (size, alignment) pair against the subsystem's minimum.
///
/// A zero size is accepted with any valid alignment.
pub fn check_alignment(bytes: u64, alignment: u64) -> Result<()> {
    if alignment < MIN_ALIGNMENT_BYTES || !alignment.is_power_of_two() {
        return Err(Error::Config(format!(
            "allocation alignment {alignment} must be a power of two >= {MIN_ALIGNMENT_BYTES}"
        )));
    }
    if bytes != 0 && !is_aligned(bytes, alignment) {
        return Err(Error::Invariant(format!(
            "allocation size {bytes} is not aligned to {alignment}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tiny_and_non_power_of_two_alignment() {
        assert!(check_alignment(0, 4).is_err());
        assert!(check_alignment(0, 24).is_err());
        assert!(check_alignment(0, 8).is_ok());
    }

    #[test]
    fn rejects_misaligned_sizes() {
        assert!(check_alignment(100, 64).is_err());
        assert!(check_alignment(128, 64).is_ok());
        assert!(check_alignment(0, 64).is_ok());
    }
}
