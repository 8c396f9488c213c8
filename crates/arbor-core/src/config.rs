//! Subsystem configuration that downstream crates can serialize/deserialize.
//!
//! Runtime handles (the allocator, reclaimers, the arbitration state-check
//! callback) are not part of this struct; `arbor-mem` combines it with
//! those into its manager options.

use serde::{Deserialize, Serialize};

use crate::bytes::MAX_MEMORY_BYTES;
use crate::error::{Error, Result};

/// Which arbitration strategy the manager builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArbitratorKind {
    /// No global accounting; every growth request is granted up to the
    /// pool's own max capacity. For deployments without a query memory cap.
    NoOp,
    /// Capacity is arbitrated from a shared budget, reclaiming from
    /// sibling pools under pressure.
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total bytes the subsystem may ever grant. `u64::MAX` means unlimited.
    /// Must equal the allocator's capacity at manager construction.
    pub capacity_bytes: u64,

    /// Arbitrable sub-budget for query pools. The arbitrator's capacity is
    /// `min(query_memory_capacity_bytes, capacity_bytes)`; the remainder is
    /// headroom for untracked system usage.
    pub query_memory_capacity_bytes: u64,

    /// Initial grant for a freshly created root pool (clamped to its max).
    pub pool_init_capacity_bytes: u64,

    /// Largest capacity slice moved between pools per reclaim step.
    pub pool_transfer_capacity_bytes: u64,

    /// Max wall time one growth request may spend waiting on reclamation.
    pub reclaim_wait_ms: u64,

    /// Minimum allocation alignment (power of two, >= 8).
    pub alignment_bytes: u64,

    /// Size of the shared leaf pool array hung off the default root.
    pub num_shared_leaf_pools: usize,

    /// Track usage under the default root (system usage such as spilling).
    pub track_default_usage: bool,

    /// Panic at manager shutdown if any root pools are still registered.
    pub check_usage_leak: bool,

    /// Extra debug bookkeeping on pools.
    pub debug_enabled: bool,

    /// Abort the process when a reservation fails on capacity, so a core
    /// dump preserves the failing state. For postmortem debugging only.
    pub core_on_allocation_failure_enabled: bool,

    pub arbitrator_kind: ArbitratorKind,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: MAX_MEMORY_BYTES,
            query_memory_capacity_bytes: MAX_MEMORY_BYTES,
            pool_init_capacity_bytes: 256 * 1024 * 1024,
            pool_transfer_capacity_bytes: 32 * 1024 * 1024,
            reclaim_wait_ms: 300_000,
            alignment_bytes: 64,
            num_shared_leaf_pools: 32,
            track_default_usage: false,
            check_usage_leak: true,
            debug_enabled: false,
            core_on_allocation_failure_enabled: false,
            arbitrator_kind: ArbitratorKind::Shared,
        }
    }
}

impl MemoryConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `ARBOR_CAPACITY_BYTES`: total capacity in bytes
    /// - `ARBOR_QUERY_MEMORY_CAPACITY_BYTES`: arbitrable sub-budget
    /// - `ARBOR_POOL_INIT_CAPACITY_BYTES`: initial root pool grant
    /// - `ARBOR_POOL_TRANSFER_CAPACITY_BYTES`: reclaim transfer step
    /// - `ARBOR_RECLAIM_WAIT_MS`: max reclaim wait per growth request
    /// - `ARBOR_ALIGNMENT_BYTES`: minimum allocation alignment
    /// - `ARBOR_NUM_SHARED_LEAF_POOLS`: shared leaf pool count
    /// - `ARBOR_CHECK_USAGE_LEAK`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("ARBOR_CAPACITY_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.capacity_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_QUERY_MEMORY_CAPACITY_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.query_memory_capacity_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_POOL_INIT_CAPACITY_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.pool_init_capacity_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_POOL_TRANSFER_CAPACITY_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.pool_transfer_capacity_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_RECLAIM_WAIT_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.reclaim_wait_ms = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_ALIGNMENT_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.alignment_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_NUM_SHARED_LEAF_POOLS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.num_shared_leaf_pools = v;
            }
        }

        if let Ok(s) = std::env::var("ARBOR_CHECK_USAGE_LEAK") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.check_usage_leak = v;
            }
        }

        cfg
    }

    /// Validate construction-time invariants. The manager refuses to start
    /// from a config that fails here.
    pub fn validate(&self) -> Result<()> {
        crate::alloc::check_alignment(0, self.alignment_bytes)?;
        if self.pool_transfer_capacity_bytes == 0 {
            return Err(Error::Config(
                "pool_transfer_capacity_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The budget actually handed to the arbitrator.
    pub fn arbitrator_capacity(&self) -> u64 {
        self.query_memory_capacity_bytes.min(self.capacity_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(MemoryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut cfg = MemoryConfig::default();
        cfg.alignment_bytes = 48;
        assert!(cfg.validate().is_err());
        cfg.alignment_bytes = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn serde_round_trip_preserves_fields() {
        let mut cfg = MemoryConfig::default();
        cfg.capacity_bytes = 1024;
        cfg.arbitrator_kind = ArbitratorKind::NoOp;
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"noop\""));
        let back: MemoryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capacity_bytes, 1024);
        assert_eq!(back.arbitrator_kind, ArbitratorKind::NoOp);
    }

    #[test]
    fn arbitrator_capacity_is_min_of_budgets() {
        let mut cfg = MemoryConfig::default();
        cfg.capacity_bytes = 1024;
        cfg.query_memory_capacity_bytes = 4096;
        assert_eq!(cfg.arbitrator_capacity(), 1024);
        cfg.query_memory_capacity_bytes = 512;
        assert_eq!(cfg.arbitrator_capacity(), 512);
    }
}
