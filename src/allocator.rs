// vim: tw=80
//! Pure helpers backing `ZoneDevice::allocate_zone` (`spec.md` §4.3, §9
//! "Allocator as strategy").
//!
//! The policy itself is one coherent entry point living on `ZoneDevice`
//! (it needs the zone pool, the resource counters, and the file registry
//! together under lock); what's factored out here are the steps that don't
//! need any of that -- key-range overlap, hint/capacity filtering, and
//! picking the best of a candidate list -- so they can be unit-tested
//! without building a whole device.

use std::sync::Arc;

use crate::lifetime::WriteLifetimeHint;
use crate::types::ByteT;
use crate::zone::Zone;

/// `true` iff the half-open-by-convention key ranges `[a.0, a.1]` and
/// `[b.0, b.1]` overlap. Keys compare lexicographically, as SST key ranges
/// normally do.
pub fn key_ranges_overlap(a: (&[u8], &[u8]), b: (&[u8], &[u8])) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

/// Step 4's filter: an Open zone with a compatible hint and at least one
/// block of free space.
pub fn hint_and_capacity_ok(zone: &Arc<Zone>, hint: WriteLifetimeHint, block_size: ByteT) -> bool {
    zone.lifetime_hint().compatible_with(hint) && zone.free_space() >= block_size
}

/// Pick the zone with the most remaining capacity; ties broken by the
/// lower `zone_id` (`spec.md` §4.3, steps 1/2/4).
pub fn best_by_capacity(candidates: &[Arc<Zone>]) -> Option<Arc<Zone>> {
    candidates
        .iter()
        .cloned()
        .max_by(|a, b| a.free_space().cmp(&b.free_space()).then(b.zone_id.cmp(&a.zone_id)))
}
