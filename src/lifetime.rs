// vim: tw=80
//! Write lifetime hints (§4.3) and their atomic storage.
//!
//! Modeled on `vdev_file.rs`'s `#[atomic_enum] enum EraseMethod`: a small,
//! `Copy` enum that several threads read and occasionally swap, so it gets
//! lock-free atomic storage via the `atomic_enum` crate rather than a
//! `Mutex<WriteLifetimeHint>`.

use atomic_enum::atomic_enum;

/// A coarse, engine-supplied prediction of how long data will remain live.
/// Ordered least to greatest per `spec.md` §4.3.
#[atomic_enum]
#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteLifetimeHint {
    NotSet,
    Short,
    Medium,
    Long,
    Extreme,
}

impl Default for WriteLifetimeHint {
    fn default() -> Self {
        WriteLifetimeHint::NotSet
    }
}

impl WriteLifetimeHint {
    /// Two hints are "compatible" under the default strict-equality policy
    /// (`spec.md` §4.3, §9 Open Question (a)). Some deployments of the
    /// original ZenFS-style allocator relax this to adjacent rungs; this
    /// crate keeps the spec's documented default and leaves the door open by
    /// funneling every hint comparison through this one function.
    pub fn compatible_with(self, other: WriteLifetimeHint) -> bool {
        self == other
    }
}
