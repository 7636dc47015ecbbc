// vim: tw=80
//! Extents: contiguous byte ranges inside one zone (`spec.md` §3).

use crate::types::{ByteT, FileId, Level, ZoneId};
use crate::lifetime::WriteLifetimeHint;

/// A contiguous `[start, start+length)` span inside one zone, owned by one
/// file. Immutable after creation except for whole-extent relocation by the
/// cleaner (which invalidates the old extent and creates a new one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub zone: ZoneId,
    pub start: ByteT,
    pub length: ByteT,
}

impl Extent {
    pub fn new(zone: ZoneId, start: ByteT, length: ByteT) -> Self {
        Extent { zone, start, length }
    }

    pub fn end(&self) -> ByteT {
        self.start + self.length
    }
}

/// The GC index entry a `Zone` keeps for every extent it hosts. Carries
/// enough of the owning file's metadata (filename, lifetime hint, level) for
/// the cleaner and allocator to make decisions without re-locking the file
/// registry for every candidate.
///
/// `owning_file` and `zone` are non-owning back-references (arena indices,
/// per the "Back-references without cycles" design note): the device owns
/// zones, files own their extents, and an `ExtentInfo` is owned by the zone
/// it describes.
#[derive(Clone, Debug)]
pub struct ExtentInfo {
    pub extent: Extent,
    pub owning_file: FileId,
    pub valid: bool,
    pub filename: String,
    pub lifetime_hint: WriteLifetimeHint,
    pub level: Level,
}

impl ExtentInfo {
    pub fn zone(&self) -> ZoneId {
        self.extent.zone
    }

    pub fn start(&self) -> ByteT {
        self.extent.start
    }

    pub fn length(&self) -> ByteT {
        self.extent.length
    }
}
