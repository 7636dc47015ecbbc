// vim: tw=80
//! Error kinds for the zone layer (`spec.md` §7).
//!
//! `bfffs-core` represents device and pool failures with a flat, largely
//! POSIX-errno-shaped enum (`Error::EINTEGRITY`, `Error::ENOTTY`, ...) that
//! callers match on directly. We keep that flavor -- one variant per error
//! kind named in the spec -- but derive it with `thiserror` rather than
//! hand-writing `Display`/`std::error::Error`, the way the rest of the
//! retrieval pack's non-`bfffs` crates do it (e.g. `anchored-leveldb`'s
//! `write_log` module).

use std::io;

use crate::types::{ByteT, ZoneId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying block device reported a failure. The zone the failing
    /// operation targeted is marked unusable for further appends but stays
    /// readable.
    #[error("I/O error on zone {zone}: {source}")]
    IoError { zone: ZoneId, #[source] source: io::Error },

    /// No zone could be allocated after the full allocator policy (and, for
    /// blocking callers, a wait) was exhausted.
    #[error("no zone available for allocation")]
    NoSpace,

    /// A precondition for `reset()` or `finish()` did not hold.
    #[error("zone {zone} is busy: {reason}")]
    Busy { zone: ZoneId, reason: &'static str },

    /// The caller asked for something the append-only model can't do:
    /// shrinking a truncate, or a positioned-append at an offset other than
    /// the current file size.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Metadata failed to decode. Fatal during replay: the spec mandates
    /// that decode errors not be silently tolerated.
    #[error("corrupt metadata record: {0}")]
    Corruption(String),

    /// The device or cleaner was cancelled via `tracker_exit`.
    #[error("shutting down")]
    Shutdown,

    /// A caller-supplied offset fell outside of the file's extent list.
    #[error("offset {offset} is out of range for a file of size {size}")]
    OutOfRange { offset: ByteT, size: ByteT },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    /// Used by backends that can't attribute the failure to one zone (e.g.
    /// enumeration). Operations that know the zone should construct
    /// `Error::IoError` directly instead.
    fn from(e: io::Error) -> Self {
        Error::IoError { zone: ZoneId::MAX, source: e }
    }
}
