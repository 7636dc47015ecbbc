// vim: tw=80
//! `ZoneDevice`: the pool of zones, the device-wide concurrency caps, the
//! file registry, and the allocator's entry point (`spec.md` §3, §4.3, §5).
//!
//! This is the aggregate root the rest of the crate is threaded through
//! explicitly -- no ambient global state, per the "Shared mutable state"
//! design note. Shaped after `bfffs-core`'s `Pool`/`Cluster`, which play the
//! same role for a RAID vdev tree: a value that owns the device handles, the
//! resource counters, and the locks that serialize access to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, instrument, warn};

use crate::allocator::{best_by_capacity, hint_and_capacity_ok, key_ranges_overlap};
use crate::device_contract::{BlockDevice, ZoneKind};
use crate::error::{Error, Result};
use crate::file::ZoneFile;
use crate::lifetime::WriteLifetimeHint;
use crate::types::{ByteT, FileId, Level, ZoneId};
use crate::zone::{Zone, ZoneState};

#[derive(Clone, Debug)]
pub struct ZoneDeviceConfig {
    /// Ceiling on zones simultaneously in the Open or Full-pending-reset
    /// range, i.e. zones that have been written to and not yet reset
    /// (`active_io_zones`).
    pub max_active: u32,
    /// Ceiling on zones simultaneously holding the append token
    /// (`open_io_zones`).
    pub max_open: u32,
    /// Number of `io_zones` set aside as cleaner scratch space
    /// (`reserved_zones`), never offered to the ordinary allocation path.
    pub reserved_zones: usize,
}

impl Default for ZoneDeviceConfig {
    fn default() -> Self {
        ZoneDeviceConfig { max_active: 8, max_open: 4, reserved_zones: 1 }
    }
}

#[derive(Default)]
struct Resources {
    active_io_zones: u32,
    open_io_zones: u32,
}

pub struct ZoneDevice {
    device: Arc<dyn BlockDevice>,
    config: ZoneDeviceConfig,
    block_size: usize,

    io_zones: Vec<Arc<Zone>>,
    meta_zones: Vec<Arc<Zone>>,
    reserved_zones: Vec<Arc<Zone>>,
    id_to_zone: HashMap<ZoneId, Arc<Zone>>,

    files: Mutex<HashMap<FileId, Arc<ZoneFile>>>,
    sst_to_zones: Mutex<HashMap<FileId, Vec<ZoneId>>>,
    next_file_id: AtomicU64,

    zone_resources_mtx: Mutex<Resources>,
    zone_resources_cv: Condvar,
    io_zones_mtx: Mutex<()>,
    zone_cleaning_mtx: Mutex<()>,

    meta_rr: AtomicU32,
    tracker_exit: AtomicBool,
}

impl ZoneDevice {
    /// Build the zone pool from the device's zone report (`spec.md` §3
    /// "Lifecycle": "Zones are created once at Open").
    #[instrument(skip(device))]
    pub fn open(device: Arc<dyn BlockDevice>, config: ZoneDeviceConfig) -> Result<Self> {
        let block_size = device.block_size();
        let geometry = device.report_zones()?;
        let mut io_zones = Vec::new();
        let mut meta_zones = Vec::new();
        let mut id_to_zone = HashMap::new();
        for g in geometry {
            let zone = Arc::new(Zone::new(g.zone_id, g.start, g.capacity, g.kind, device.clone()));
            id_to_zone.insert(g.zone_id, zone.clone());
            match g.kind {
                ZoneKind::Data => io_zones.push(zone),
                ZoneKind::Meta => meta_zones.push(zone),
            }
        }
        io_zones.sort_by_key(|z| z.zone_id);
        meta_zones.sort_by_key(|z| z.zone_id);

        let n_reserved = config.reserved_zones.min(io_zones.len());
        let reserved_zones = io_zones.split_off(io_zones.len() - n_reserved);

        debug!(
            data = io_zones.len(),
            reserved = reserved_zones.len(),
            meta = meta_zones.len(),
            "opened zone device"
        );

        Ok(ZoneDevice {
            device,
            config,
            block_size,
            io_zones,
            meta_zones,
            reserved_zones,
            id_to_zone,
            files: Mutex::new(HashMap::new()),
            sst_to_zones: Mutex::new(HashMap::new()),
            next_file_id: AtomicU64::new(1),
            zone_resources_mtx: Mutex::new(Resources::default()),
            zone_resources_cv: Condvar::new(),
            io_zones_mtx: Mutex::new(()),
            zone_cleaning_mtx: Mutex::new(()),
            meta_rr: AtomicU32::new(0),
            tracker_exit: AtomicBool::new(false),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn zone(&self, id: ZoneId) -> Option<Arc<Zone>> {
        self.id_to_zone.get(&id).cloned()
    }

    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    pub fn active_io_zones(&self) -> u32 {
        self.zone_resources_mtx.lock().unwrap().active_io_zones
    }

    pub fn open_io_zones(&self) -> u32 {
        self.zone_resources_mtx.lock().unwrap().open_io_zones
    }

    pub fn max_active(&self) -> u32 {
        self.config.max_active
    }

    pub fn max_open(&self) -> u32 {
        self.config.max_open
    }

    pub fn next_file_id(&self) -> FileId {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_file(&self, file: Arc<ZoneFile>) {
        self.files.lock().unwrap().insert(file.file_id(), file);
    }

    pub fn lookup_file(&self, id: FileId) -> Option<Arc<ZoneFile>> {
        self.files.lock().unwrap().get(&id).cloned()
    }

    pub fn unregister_file(&self, id: FileId) -> Option<Arc<ZoneFile>> {
        self.sst_to_zones.lock().unwrap().remove(&id);
        self.files.lock().unwrap().remove(&id)
    }

    pub fn files_snapshot(&self) -> Vec<Arc<ZoneFile>> {
        self.files.lock().unwrap().values().cloned().collect()
    }

    pub fn record_sst_zone(&self, file_id: FileId, zone_id: ZoneId) {
        let mut map = self.sst_to_zones.lock().unwrap();
        let v = map.entry(file_id).or_default();
        if !v.contains(&zone_id) {
            v.push(zone_id);
        }
    }

    pub fn shutdown(&self) {
        self.tracker_exit.store(true, Ordering::SeqCst);
        self.zone_resources_cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.tracker_exit.load(Ordering::SeqCst)
    }

    // ---- Supplementary accessors (SPEC_FULL.md §11, grounded on zns.rs) ----

    pub fn free_space(&self) -> ByteT {
        self.io_zones.iter().map(|z| z.free_space()).sum()
    }

    pub fn used_capacity_total(&self) -> ByteT {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    pub fn zone_state_counts(&self) -> (usize, usize, usize) {
        let (mut empty, mut open, mut full) = (0, 0, 0);
        for z in &self.io_zones {
            match z.state() {
                ZoneState::Empty => empty += 1,
                ZoneState::Open => open += 1,
                ZoneState::Full => full += 1,
            }
        }
        (empty, open, full)
    }

    // ---- Allocation (spec.md §4.3) ----

    /// The five-step policy. Blocks (step 5) until a zone is available or
    /// the device is shut down.
    #[instrument(skip(self, smallest_key, largest_key))]
    pub fn allocate_zone(
        &self,
        file_id: FileId,
        hint: WriteLifetimeHint,
        smallest_key: &[u8],
        largest_key: &[u8],
        level: Level,
    ) -> Result<Arc<Zone>> {
        loop {
            if self.is_shutdown() {
                return Err(Error::Shutdown);
            }
            if let Some(zone) = self.try_allocate_once(file_id, hint, smallest_key, largest_key, level)? {
                return Ok(zone);
            }
            // Step 5: wait.
            let guard = self.zone_resources_mtx.lock().unwrap();
            let (_guard, timeout) = self
                .zone_resources_cv
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap();
            let _ = timeout;
        }
    }

    /// Steps 1-4 of the policy, without blocking. `None` means step 5
    /// (waiting) applies. The write token is claimed, and the resource
    /// counters bumped, for the chosen zone before `io_zones_mtx` is
    /// released, so no other caller can observe the same zone as free in
    /// the gap between selection and claim (this is also why the claim and
    /// the counter update must happen together: a lost claim must never
    /// leave a counter incremented for a zone this call didn't end up
    /// using).
    fn try_allocate_once(
        &self,
        file_id: FileId,
        hint: WriteLifetimeHint,
        smallest_key: &[u8],
        largest_key: &[u8],
        level: Level,
    ) -> Result<Option<Arc<Zone>>> {
        let _guard = self.io_zones_mtx.lock().unwrap();

        // Step 1: same-file/same-level affinity with key-range overlap.
        if let Some(zone) = self.affinity_candidate(file_id, hint, smallest_key, largest_key, level, true) {
            return Ok(Some(zone));
        }
        // Step 2: level affinity only.
        if let Some(zone) = self.affinity_candidate(file_id, hint, smallest_key, largest_key, level, false) {
            return Ok(Some(zone));
        }
        // Step 3: empty zone, subject to both the active and open caps.
        {
            let mut res = self.zone_resources_mtx.lock().unwrap();
            if res.active_io_zones < self.config.max_active && res.open_io_zones < self.config.max_open {
                if let Some(zone) = self.io_zones.iter().find(|z| z.state() == ZoneState::Empty) {
                    if zone.try_open_for_write(file_id, hint) {
                        res.active_io_zones += 1;
                        res.open_io_zones += 1;
                        return Ok(Some(zone.clone()));
                    }
                }
            }
        }
        // Step 4: hint-compatible partially-written zone, subject to the
        // open cap (it never claims an Empty zone, so the active cap does
        // not apply).
        let candidates: Vec<_> = self
            .io_zones
            .iter()
            .filter(|z| {
                z.state() == ZoneState::Open
                    && !z.is_open_for_write()
                    && z.lifetime_hint().compatible_with(hint)
                    && z.free_space() >= self.block_size as u64
            })
            .cloned()
            .collect();
        if let Some(zone) = best_by_capacity(&candidates) {
            let mut res = self.zone_resources_mtx.lock().unwrap();
            if res.open_io_zones < self.config.max_open && zone.try_open_for_write(file_id, hint) {
                res.open_io_zones += 1;
                return Ok(Some(zone));
            }
        }
        Ok(None)
    }

    fn affinity_candidate(
        &self,
        file_id: FileId,
        hint: WriteLifetimeHint,
        smallest_key: &[u8],
        largest_key: &[u8],
        level: Level,
        require_overlap: bool,
    ) -> Option<Arc<Zone>> {
        let sst_map = self.sst_to_zones.lock().unwrap();
        let files = self.files.lock().unwrap();
        let mut candidate_zones: Vec<ZoneId> = Vec::new();
        for (fid, zone_ids) in sst_map.iter() {
            let Some(f) = files.get(fid) else { continue };
            if f.level() != level {
                continue;
            }
            if require_overlap && !key_ranges_overlap((smallest_key, largest_key), (f.smallest_key(), f.largest_key())) {
                continue;
            }
            candidate_zones.extend(zone_ids.iter().copied());
        }
        drop(files);
        drop(sst_map);

        let zones: Vec<_> = candidate_zones
            .into_iter()
            .filter_map(|id| self.id_to_zone.get(&id).cloned())
            .filter(|z| !z.is_open_for_write() && hint_and_capacity_ok(z, hint, self.block_size as u64))
            .collect();
        let zone = best_by_capacity(&zones)?;
        let was_empty = zone.state() == ZoneState::Empty;
        let mut res = self.zone_resources_mtx.lock().unwrap();
        if res.open_io_zones >= self.config.max_open || (was_empty && res.active_io_zones >= self.config.max_active) {
            return None;
        }
        if !zone.try_open_for_write(file_id, hint) {
            return None;
        }
        if was_empty {
            res.active_io_zones += 1;
        }
        res.open_io_zones += 1;
        Some(zone)
    }

    /// Allocation for the cleaner: reserved zones first, then the most
    /// invalidated/least-live zone among ordinary `io_zones`. Never blocks
    /// on the active/open caps (`spec.md` §4.3).
    ///
    /// The returned `bool` is `true` when the zone came from
    /// `reserved_zones`: those zones are cleaner scratch space outside the
    /// active/open caps and were never counted into them, so the caller
    /// must release them directly (`Zone::close_wr`/`Zone::finish`) rather
    /// than through `close_zone_for_write`/`finish_zone`, which would
    /// decrement counters that were never incremented for them.
    pub fn allocate_zone_for_cleaning(&self, holder: FileId, hint: WriteLifetimeHint) -> Result<(Arc<Zone>, bool)> {
        for zone in &self.reserved_zones {
            if zone.try_open_for_write(holder, hint) {
                return Ok((zone.clone(), true));
            }
        }
        let mut candidates: Vec<_> = self
            .io_zones
            .iter()
            .filter(|z| !z.is_open_for_write() && z.state() != ZoneState::Full)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.used_capacity()
                .cmp(&b.used_capacity())
                .then(b.invalid_bytes().cmp(&a.invalid_bytes()))
        });
        for zone in candidates {
            let was_empty = zone.state() == ZoneState::Empty;
            if zone.try_open_for_write(holder, hint) {
                // Drawn from the ordinary pool, so its Empty->Open
                // transition still counts against the caps even though
                // this path doesn't block on them (spec.md §5).
                let mut res = self.zone_resources_mtx.lock().unwrap();
                if was_empty {
                    res.active_io_zones += 1;
                }
                res.open_io_zones += 1;
                return Ok((zone, false));
            }
        }
        Err(Error::NoSpace)
    }

    /// Round-robin allocation among `meta_zones` (`spec.md` §4.3).
    pub fn allocate_meta_zone(&self) -> Arc<Zone> {
        let idx = self.meta_rr.fetch_add(1, Ordering::Relaxed) as usize % self.meta_zones.len();
        self.meta_zones[idx].clone()
    }

    /// Zones ranked by invalid bytes descending, for the cleaner's victim
    /// scan (`gc_queue`, `spec.md` §3/§4.4).
    pub fn gc_candidates(&self) -> Vec<Arc<Zone>> {
        let mut zones: Vec<_> = self.io_zones.iter().filter(|z| z.state() != ZoneState::Empty).cloned().collect();
        zones.sort_by(|a, b| b.invalid_bytes().cmp(&a.invalid_bytes()));
        zones
    }

    pub fn finish_zone(&self, zone: &Arc<Zone>) -> Result<()> {
        zone.finish()?;
        let mut res = self.zone_resources_mtx.lock().unwrap();
        res.active_io_zones = res.active_io_zones.saturating_sub(1);
        drop(res);
        self.zone_resources_cv.notify_all();
        Ok(())
    }

    pub fn close_zone_for_write(&self, zone: &Arc<Zone>) -> Result<()> {
        zone.close_wr()?;
        let mut res = self.zone_resources_mtx.lock().unwrap();
        res.open_io_zones = res.open_io_zones.saturating_sub(1);
        drop(res);
        self.zone_resources_cv.notify_all();
        Ok(())
    }

    /// Reset always decrements `open_io_zones`'s sibling counter,
    /// `active_io_zones`, unless the zone was already `Full` (in which case
    /// `finish_zone` decremented it already). The cleaner resets zones with
    /// `used_capacity() == 0` directly, without ever calling `finish_zone`
    /// on them first (`spec.md` §4.4's fast path for an already-empty
    /// victim), so a zone can reach `reset_zone` still in the `Open` state
    /// and `active_io_zones` must be settled here instead.
    pub fn reset_zone(&self, zone: &Arc<Zone>) -> Result<()> {
        let was_active_unfinished = zone.state() != ZoneState::Full;
        zone.reset()?;
        if was_active_unfinished {
            let mut res = self.zone_resources_mtx.lock().unwrap();
            res.active_io_zones = res.active_io_zones.saturating_sub(1);
            drop(res);
        }
        self.zone_resources_cv.notify_all();
        Ok(())
    }

    pub fn zone_cleaning_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.zone_cleaning_mtx.lock().unwrap()
    }
}

#[cfg(test)]
mod t {
    use super::*;
    use crate::device_contract::MemBlockDevice;

    fn dev(max_active: u32, max_open: u32) -> ZoneDevice {
        let d: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4, 1, 1 << 20, 4096));
        ZoneDevice::open(d, ZoneDeviceConfig { max_active, max_open, reserved_zones: 1 }).unwrap()
    }

    #[test]
    fn open_partitions_data_and_meta_zones() {
        let d = dev(8, 8);
        assert_eq!(d.io_zones().len(), 3); // 4 data zones minus 1 reserved
        assert_eq!(d.meta_zones.len(), 1);
    }

    #[test]
    fn step3_takes_lowest_id_empty_zone() {
        let d = dev(8, 8);
        let z = d.allocate_zone(1, WriteLifetimeHint::Short, b"a", b"z", 0).unwrap();
        assert_eq!(z.zone_id, 0);
        assert_eq!(d.active_io_zones(), 1);
        assert_eq!(d.open_io_zones(), 1);
    }

    #[test]
    fn active_cap_blocks_more_than_max_active_empty_zones() {
        let d = dev(1, 8);
        let z0 = d.allocate_zone(1, WriteLifetimeHint::Short, b"a", b"z", 0).unwrap();
        d.close_zone_for_write(&z0).unwrap();
        // With only 1 slot and it already active+full-open-then-closed but
        // not finished, a second *empty* zone claim should fail step 3
        // since active_io_zones is still 1; step 4 also fails since the
        // zone is no longer open-for-write but has no matching hint
        // pressure test here, so we only assert the cap bookkeeping.
        assert_eq!(d.active_io_zones(), 1);
    }

    #[test]
    fn open_cap_blocks_a_second_empty_zone_even_under_the_active_cap() {
        let d = dev(8, 1);
        let z0 = d.allocate_zone(1, WriteLifetimeHint::Short, b"a", b"z", 0).unwrap();
        assert_eq!(d.open_io_zones(), 1);
        // Step 3 would happily claim a second Empty zone on the active cap
        // alone; the open cap must still block it.
        assert!(d.try_allocate_once(2, WriteLifetimeHint::Short, b"a", b"z", 0).unwrap().is_none());
        d.close_zone_for_write(&z0).unwrap();
        let z1 = d.allocate_zone(2, WriteLifetimeHint::Short, b"a", b"z", 0).unwrap();
        assert_eq!(z1.zone_id, 1);
    }

    #[test]
    fn meta_allocation_round_robins() {
        let d = dev(8, 8);
        let m0 = d.allocate_meta_zone();
        assert_eq!(m0.zone_id, 4);
    }

    #[test]
    fn shutdown_fails_pending_allocation() {
        let d = dev(0, 0);
        d.shutdown();
        let res = d.allocate_zone(1, WriteLifetimeHint::Short, b"a", b"z", 0);
        assert!(matches!(res, Err(Error::Shutdown)));
    }
}
