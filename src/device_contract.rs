// vim: tw=80
//! The raw device contract (`spec.md` §6, "Device contract (consumed)").
//!
//! This is the narrow interface the core consumes from the actual block
//! device driver, which is itself out of scope (`spec.md` §1). Modeled on
//! how `bfffs-core`'s `Vdev`/`VdevBlock` traits sit between the core pool
//! logic and `VdevFile`: a small trait, mocked with `mockall` in unit tests,
//! and backed by a real (here, in-memory) implementation for integration
//! tests and examples.

use std::sync::{Mutex, RwLock};

#[cfg(test)] use mockall::automock;

use crate::error::{Error, Result};
use crate::types::ZoneId;

/// Is this a data zone (for SSTs and the WAL) or a metadata zone (for the
/// journal)?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneKind {
    Data,
    Meta,
}

/// One entry of a device's zone report, as returned by [`BlockDevice::report_zones`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneGeometry {
    pub zone_id: ZoneId,
    pub start: u64,
    pub capacity: u64,
    pub kind: ZoneKind,
}

/// The contract the zone layer needs from a zoned block device. Writes
/// succeed only at the zone's current write pointer and advance it by
/// exactly the bytes submitted; a write at any other offset is a logic
/// error in the caller (the zone layer never attempts one) rather than a
/// condition this trait needs to model.
#[cfg_attr(test, automock)]
pub trait BlockDevice: Send + Sync {
    /// Enumerate all zones on the device. Called exactly once, at `Open`.
    fn report_zones(&self) -> Result<Vec<ZoneGeometry>>;

    /// Open a zone for writing. No-op on devices without native zone state.
    fn open_zone(&self, zone: ZoneId) -> Result<()>;

    /// Release the write token for a zone. No-op on devices without native
    /// zone state.
    fn close_zone(&self, zone: ZoneId) -> Result<()>;

    /// Force a zone to the Full state without further writes.
    fn finish_zone(&self, zone: ZoneId) -> Result<()>;

    /// Reset a zone to Empty, discarding its contents.
    fn reset_zone(&self, zone: ZoneId) -> Result<()>;

    /// Direct, aligned write at `offset_in_zone`, which the caller guarantees
    /// equals that zone's current write pointer.
    fn write_at(&self, zone: ZoneId, offset_in_zone: u64, buf: &[u8]) -> Result<()>;

    /// Aligned read of up to `buf.len()` bytes starting at `offset_in_zone`.
    /// Returns the number of bytes actually read (may be short at EOF).
    fn read_at(&self, zone: ZoneId, offset_in_zone: u64, buf: &mut [u8]) -> Result<usize>;

    /// The device's block size, in bytes. `get_required_buffer_alignment`
    /// (§6) is implemented in terms of this.
    fn block_size(&self) -> usize;
}

/// An in-memory [`BlockDevice`] used by functional tests and examples. Real
/// callers wire up an actual zoned-device driver; this crate's non-goals
/// (§1) exclude shipping one.
pub struct MemBlockDevice {
    block_size: usize,
    zones: Vec<ZoneGeometry>,
    // One buffer per zone, sized to that zone's capacity. A RwLock per zone
    // would be more concurrent, but a test backend doesn't need to be fast,
    // only correct and easy to reason about under concurrent append tests.
    storage: Vec<RwLock<Vec<u8>>>,
    wps: Mutex<Vec<u64>>,
}

impl MemBlockDevice {
    /// Build a device of `n_data` data zones and `n_meta` metadata zones,
    /// each `zone_capacity` bytes, with the given block size.
    pub fn new(n_data: u32, n_meta: u32, zone_capacity: u64, block_size: usize) -> Self {
        let mut zones = Vec::with_capacity((n_data + n_meta) as usize);
        let mut storage = Vec::with_capacity((n_data + n_meta) as usize);
        let mut start = 0u64;
        for i in 0..n_data {
            zones.push(ZoneGeometry { zone_id: i, start, capacity: zone_capacity, kind: ZoneKind::Data });
            storage.push(RwLock::new(vec![0u8; zone_capacity as usize]));
            start += zone_capacity;
        }
        for i in 0..n_meta {
            zones.push(ZoneGeometry { zone_id: n_data + i, start, capacity: zone_capacity, kind: ZoneKind::Meta });
            storage.push(RwLock::new(vec![0u8; zone_capacity as usize]));
            start += zone_capacity;
        }
        let wps = Mutex::new(vec![0u64; (n_data + n_meta) as usize]);
        MemBlockDevice { block_size, zones, storage, wps }
    }
}

impl BlockDevice for MemBlockDevice {
    fn report_zones(&self) -> Result<Vec<ZoneGeometry>> {
        Ok(self.zones.clone())
    }

    fn open_zone(&self, _zone: ZoneId) -> Result<()> {
        Ok(())
    }

    fn close_zone(&self, _zone: ZoneId) -> Result<()> {
        Ok(())
    }

    fn finish_zone(&self, _zone: ZoneId) -> Result<()> {
        Ok(())
    }

    fn reset_zone(&self, zone: ZoneId) -> Result<()> {
        let idx = zone as usize;
        self.storage[idx].write().unwrap().iter_mut().for_each(|b| *b = 0);
        self.wps.lock().unwrap()[idx] = 0;
        Ok(())
    }

    fn write_at(&self, zone: ZoneId, offset_in_zone: u64, buf: &[u8]) -> Result<()> {
        let idx = zone as usize;
        {
            let mut wps = self.wps.lock().unwrap();
            if wps[idx] != offset_in_zone {
                return Err(Error::Busy {
                    zone,
                    reason: "write_at offset does not match the zone's write pointer",
                });
            }
            wps[idx] += buf.len() as u64;
        }
        let mut storage = self.storage[idx].write().unwrap();
        let start = offset_in_zone as usize;
        storage[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn read_at(&self, zone: ZoneId, offset_in_zone: u64, buf: &mut [u8]) -> Result<usize> {
        let idx = zone as usize;
        let storage = self.storage[idx].read().unwrap();
        let start = offset_in_zone as usize;
        let avail = storage.len().saturating_sub(start);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&storage[start..start + n]);
        Ok(n)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}
