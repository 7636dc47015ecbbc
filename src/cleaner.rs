// vim: tw=80
//! `zone_cleaning`: the garbage collector (`spec.md` §4.4).
//!
//! Copies still-live extents out of heavily invalidated zones, patches the
//! owning files' extent lists in place, persists the change, and only then
//! resets the source zone -- the fsync-before-reset ordering the spec
//! requires for crash consistency.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::device::ZoneDevice;
use crate::error::Result;
use crate::extent::{Extent, ExtentInfo};
use crate::lifetime::WriteLifetimeHint;
use crate::metadata::{self, MetadataWriter};
use crate::types::FileId;
use crate::zone::Zone;

/// A `FileId` no real file ever takes (ids are assigned starting at 1 and
/// only increase), used as the cleaner's own write-token identity when it
/// claims a destination zone.
const CLEANER_TOKEN: FileId = FileId::MAX;

struct DestZone {
    zone: Option<Arc<Zone>>,
    /// Whether `zone` was drawn from `reserved_zones`. Reserved zones never
    /// counted against `active_io_zones`/`open_io_zones`, so releasing one
    /// must bypass `ZoneDevice`'s cap-decrementing wrappers.
    is_reserved: bool,
}

impl DestZone {
    fn acquire(&mut self, device: &ZoneDevice, hint: WriteLifetimeHint, needed: u64) -> Result<Arc<Zone>> {
        if let Some(z) = &self.zone {
            if z.free_space() >= needed {
                return Ok(z.clone());
            }
            release(device, z, self.is_reserved)?;
            self.zone = None;
        }
        let (z, is_reserved) = device.allocate_zone_for_cleaning(CLEANER_TOKEN, hint)?;
        self.zone = Some(z.clone());
        self.is_reserved = is_reserved;
        Ok(z)
    }

    fn close(&mut self, device: &ZoneDevice) -> Result<()> {
        if let Some(z) = self.zone.take() {
            release(device, &z, self.is_reserved)?;
        }
        Ok(())
    }
}

/// Release a destination zone's write token, matching whichever pool it was
/// drawn from: a reserved zone releases directly (no cap bookkeeping to
/// undo), an ordinary `io_zones` zone releases through the device so its
/// claimed counters come back down.
fn release(device: &ZoneDevice, zone: &Arc<Zone>, is_reserved: bool) -> Result<()> {
    if is_reserved {
        zone.close_wr()
    } else {
        device.close_zone_for_write(zone)
    }
}

/// Same distinction as `release`, for the finish-on-fill path.
fn finish(device: &ZoneDevice, zone: &Arc<Zone>, is_reserved: bool) -> Result<()> {
    if is_reserved {
        zone.finish()
    } else {
        device.finish_zone(zone)
    }
}

fn relocate(device: &ZoneDevice, dest: &mut DestZone, info: &ExtentInfo, src: &Arc<Zone>) -> Result<Extent> {
    let zone = dest.acquire(device, info.lifetime_hint, info.length())?;
    let mut buf = vec![0u8; info.length() as usize];
    src.read_at(info.start() - src.start, &mut buf)?;
    let off = zone.append(CLEANER_TOKEN, &buf, device.block_size())?;
    let new_extent = Extent::new(zone.zone_id, off, info.length());
    zone.record_extent(ExtentInfo {
        extent: new_extent,
        owning_file: info.owning_file,
        valid: true,
        filename: info.filename.clone(),
        lifetime_hint: info.lifetime_hint,
        level: info.level,
    });
    if zone.free_space() == 0 {
        finish(device, &zone, dest.is_reserved)?;
        release(device, &zone, dest.is_reserved)?;
        dest.zone = None;
    }
    Ok(new_extent)
}

/// Reclaim up to `k` zones (`spec.md` §4.4). Returns the number of zones
/// actually reset. Serialized against other cleaner passes by
/// `ZoneDevice`'s `zone_cleaning_mtx`.
#[instrument(skip(device, metadata_writer))]
pub fn zone_cleaning(device: &Arc<ZoneDevice>, k: usize, metadata_writer: &dyn MetadataWriter) -> Result<usize> {
    let _pass = device.zone_cleaning_lock();
    let mut reclaimed = 0usize;
    let mut dest = DestZone { zone: None, is_reserved: false };

    for victim in device.gc_candidates().into_iter().take(k) {
        if device.is_shutdown() {
            break;
        }
        if victim.used_capacity() == 0 {
            device.reset_zone(&victim)?;
            reclaimed += 1;
            continue;
        }

        let valid = victim.valid_extents();
        let mut file_ids: Vec<FileId> = valid.iter().map(|e| e.owning_file).collect();
        file_ids.sort_unstable();
        file_ids.dedup();
        let touched_files: Vec<_> = file_ids.iter().filter_map(|id| device.lookup_file(*id)).collect();

        for info in &valid {
            let Some(file) = device.lookup_file(info.owning_file) else {
                // The owning file is gone; its extents should already have
                // been invalidated on deletion. Nothing live to relocate.
                warn!(zone = victim.zone_id, file = info.owning_file, "live extent with no owning file, skipping");
                continue;
            };
            match relocate(device, &mut dest, info, &victim) {
                Ok(new_extent) => {
                    file.patch_extent(info.extent, new_extent)?;
                    victim.invalidate(info.extent);
                }
                Err(e) => {
                    warn!(zone = victim.zone_id, "relocation failed, leaving zone for retry: {e}");
                    continue;
                }
            }
        }

        for file in &touched_files {
            // A full snapshot is always a safe (if not maximally terse)
            // replacement record: it's self-contained and doesn't depend
            // on the reader having any prior record for this file.
            let record = metadata::encode_snapshot_to(file, |zid| device.zone(zid).map(|z| z.start).unwrap_or(0));
            metadata_writer.persist(&record)?;
            file.metadata_synced();
        }

        // Rule: reset only follows the fsync of the metadata record that
        // records the replacement extents (spec.md §4.4).
        if victim.used_capacity() == 0 {
            device.reset_zone(&victim)?;
            reclaimed += 1;
            info!(zone = victim.zone_id, "cleaner reset zone");
        }
    }

    dest.close(device)?;
    Ok(reclaimed)
}
