//! Byte-size constants, alignment math, and human-readable formatting.

/// Sentinel for "unlimited" capacity. Pools and managers at this capacity
/// are never subject to arbitration.
pub const MAX_MEMORY_BYTES: u64 = u64::MAX;

/// Smallest allocation alignment the subsystem accepts.
pub const MIN_ALIGNMENT_BYTES: u64 = 8;

/// Round `bytes` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two; saturates instead of wrapping so an
/// unlimited request stays unlimited.
pub fn align_up(bytes: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    bytes.saturating_add(mask) & !mask
}

/// Whether `bytes` is a multiple of `alignment`.
pub fn is_aligned(bytes: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    bytes & (alignment - 1) == 0
}

/// Compact human-readable byte count for diagnostics ("UNLIMITED", "512B",
/// "4.00KB", "1.50GB"). Not a stable machine format.
pub fn fmt_bytes(bytes: u64) -> String {
    if bytes == MAX_MEMORY_BYTES {
        return "UNLIMITED".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}
