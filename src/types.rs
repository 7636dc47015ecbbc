// vim: tw=80
//! Primitive type aliases shared across the crate.
//!
//! Kept deliberately thin, the way `bfffs-core`'s own `types.rs` collects
//! `LbaT`/`ZoneT`/`ClusterT` aliases rather than wrapping them in newtypes:
//! these values cross so many module boundaries that a newtype would only
//! add noise.

/// Absolute byte offset, either on the whole device or within a zone,
/// depending on context.
pub type ByteT = u64;

/// Dense, zero-based zone identifier.
pub type ZoneId = u32;

/// Unique, monotonically increasing file identifier.
pub type FileId = u64;

/// LSM level of an SST file. Also used as a coarse lifetime proxy (§4.3).
pub type Level = u8;

/// Default block size assumed when a test or example doesn't otherwise
/// configure one. Real geometries come from [`crate::device::ZoneDeviceConfig`].
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Round `n` up to the next multiple of `block_size`.
pub fn round_up(n: u64, block_size: u64) -> u64 {
    debug_assert!(block_size.is_power_of_two() || block_size > 0);
    n.div_ceil(block_size) * block_size
}

/// `true` iff `n` is an exact multiple of `block_size`.
pub fn is_aligned(n: u64, block_size: u64) -> bool {
    n % block_size == 0
}
