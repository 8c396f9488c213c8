//! Pluggable reclamation capability.
//!
//! A reclaimer frees memory held by a pool's owner on demand, typically by
//! spilling to disk or evicting cached state. The arbitrator invokes it
//! synchronously mid-arbitration; the concrete algorithm lives with the
//! pool's owner, never here.

use crate::pool::MemoryPool;

/// Per-pool reclamation hook installed at pool creation.
///
/// Implementations must release usage through the normal pool release path
/// (so the freed bytes become spare capacity the arbitrator can take) and
/// must not request growth on, or destroy, any registered pool while
/// reclaiming; arbitration is in progress on the calling thread and both
/// paths would re-enter it.
pub trait MemoryReclaimer: Send + Sync {
    /// Try to free up to `target_bytes` of usage under `pool`, spending at
    /// most `wait_ms` doing so. Returns the bytes actually freed; zero
    /// means no further reclaim is possible right now.
    fn reclaim(&self, pool: &MemoryPool, target_bytes: u64, wait_ms: u64) -> u64;
}
