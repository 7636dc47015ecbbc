// vim: tw=80
//! `unique_id`: a stable, ≤16-byte identifier for a file, usable by callers
//! that cache file identity across cleaning (`spec.md` §6).
//!
//! `file_id` alone would do for the lifetime of one `ZoneDevice`, but the
//! spec calls for an explicit `generation` component so that, if a
//! `file_id` is ever reused (this crate never reuses one, but a caller
//! building on top might recycle slots), stale cached ids don't alias a
//! new file. Encoded as two little-endian `u64`s, matching the rest of the
//! crate's fixed-width wire conventions (`metadata.rs`).

use crate::types::FileId;

pub const UNIQUE_ID_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniqueId {
    pub file_id: FileId,
    pub generation: u64,
}

impl UniqueId {
    pub fn new(file_id: FileId, generation: u64) -> Self {
        UniqueId { file_id, generation }
    }

    pub fn encode(&self) -> [u8; UNIQUE_ID_LEN] {
        let mut out = [0u8; UNIQUE_ID_LEN];
        out[..8].copy_from_slice(&self.file_id.to_le_bytes());
        out[8..].copy_from_slice(&self.generation.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; UNIQUE_ID_LEN]) -> Self {
        let file_id = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        let generation = u64::from_le_bytes(bytes[8..].try_into().unwrap());
        UniqueId { file_id, generation }
    }
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let id = UniqueId::new(42, 7);
        assert_eq!(UniqueId::decode(&id.encode()), id);
    }

    #[test]
    fn distinct_files_encode_distinctly() {
        assert_ne!(UniqueId::new(1, 0).encode(), UniqueId::new(2, 0).encode());
    }
}
