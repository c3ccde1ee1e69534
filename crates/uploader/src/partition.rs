//! Stable partition assignment.
//!
//! Partition keys must agree across processes and platforms so that every
//! event for one experimental unit lands in the same partition.

/// FNV-1a over the key bytes followed by a SplitMix64 finalizer.
#[must_use]
pub fn stable_hash64(key: &str) -> u64 {
    let mut h: u64 = 14695981039346656037u64;
    for b in key.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211u64);
    }
    splitmix64(h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// `stable_hash64(key) mod count` when a partition count is configured,
/// otherwise the key itself.
pub fn partition_key(key: &str, partition_count: Option<u32>) -> String {
    match partition_count {
        Some(count) if count > 0 => (stable_hash64(key) % count as u64).to_string(),
        _ => key.to_string(),
    }
}
