// vim: tw=80
//! `ZoneFile`: one logical append-only file, physically an ordered list of
//! extents (`spec.md` §3, §4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};

use tracing::{debug, instrument};

use crate::device::ZoneDevice;
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentInfo};
use crate::extent_lock::ExtentLock;
use crate::lifetime::{AtomicWriteLifetimeHint, WriteLifetimeHint};
use crate::metadata::{self, DecodedFile};
use crate::types::{ByteT, FileId, Level};
use crate::zone::Zone;
use std::sync::Arc;

struct PendingBuffer {
    data: Vec<u8>,
    /// Bytes of `data`, from the front, that are logical file content; the
    /// rest is on-media block-alignment padding (`spec.md` §4.2 `append`).
    valid: usize,
}

struct ActiveState {
    zone: Option<Arc<Zone>>,
    /// Device offset of the extent currently being accumulated on `zone`,
    /// if any bytes have landed since the zone was claimed or the last
    /// extent was finalized.
    extent_start: Option<ByteT>,
    /// Bytes written to `zone` since `extent_start`, including any tail
    /// padding (`spec.md` §4.2 `push_extent`).
    extent_phys_len: ByteT,
}

pub struct ZoneFile {
    file_id: FileId,
    device: Weak<ZoneDevice>,
    filename: Mutex<String>,
    /// Logical byte count actually exposed to readers; excludes any tail
    /// padding written to satisfy block alignment.
    size: AtomicU64,
    level: Level,
    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    is_sst: bool,
    lifetime_hint: AtomicWriteLifetimeHint,
    is_appending: AtomicBool,
    marked_for_del: AtomicBool,
    synced_extent_count: AtomicUsize,
    extents: ExtentLock<Vec<Extent>>,
    active: Mutex<ActiveState>,
    pending: Mutex<VecDeque<PendingBuffer>>,
}

impl ZoneFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Arc<ZoneDevice>,
        file_id: FileId,
        filename: String,
        lifetime_hint: WriteLifetimeHint,
        level: Level,
        smallest_key: Vec<u8>,
        largest_key: Vec<u8>,
        is_sst: bool,
    ) -> Arc<Self> {
        Arc::new(ZoneFile {
            file_id,
            device: Arc::downgrade(device),
            filename: Mutex::new(filename),
            size: AtomicU64::new(0),
            level,
            smallest_key,
            largest_key,
            is_sst,
            lifetime_hint: AtomicWriteLifetimeHint::new(lifetime_hint),
            is_appending: AtomicBool::new(false),
            marked_for_del: AtomicBool::new(false),
            synced_extent_count: AtomicUsize::new(0),
            extents: ExtentLock::new(Vec::new()),
            active: Mutex::new(ActiveState { zone: None, extent_start: None, extent_phys_len: 0 }),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Reconstruct a `ZoneFile` from a decoded metadata record (`spec.md`
    /// §4.2 `decode_from`, resolving zone references through the device's
    /// registry).
    pub fn from_decoded(device: &Arc<ZoneDevice>, decoded: &DecodedFile) -> Result<Arc<Self>> {
        let file = ZoneFile::new(
            device,
            decoded.file_id,
            decoded.filename.clone(),
            decoded.lifetime_hint,
            decoded.level,
            decoded.smallest_key.clone(),
            decoded.largest_key.clone(),
            decoded.is_sst,
        );
        file.apply_decoded_extents(device, &decoded.extents)?;
        Ok(file)
    }

    fn apply_decoded_extents(&self, device: &Arc<ZoneDevice>, rels: &[metadata::RelativeExtent]) -> Result<()> {
        let mut size = 0u64;
        let mut guard = self.extents.write();
        for rel in rels {
            let zone = device.zone(rel.zone_id).ok_or_else(|| Error::Corruption(format!("unknown zone {}", rel.zone_id)))?;
            let extent = metadata::resolve_extent(*rel, zone.start);
            size += extent.length;
            guard.push(extent);
        }
        drop(guard);
        self.size.store(size, Ordering::Release);
        self.synced_extent_count.store(rels.len(), Ordering::Release);
        Ok(())
    }

    /// Reconcile an incremental update record with this in-memory file: the
    /// decoded extents must begin exactly at `synced_extent_count`
    /// (`spec.md` §4.2 `merge_update`).
    pub fn merge_update(&self, device: &Arc<ZoneDevice>, decoded: &DecodedFile) -> Result<()> {
        *self.filename.lock().unwrap() = decoded.filename.clone();
        self.lifetime_hint.store(decoded.lifetime_hint, Ordering::Release);

        let synced = self.synced_extent_count.load(Ordering::Acquire);
        let mut added = 0u64;
        let mut guard = self.extents.write();
        if guard.len() != synced {
            return Err(Error::Corruption("merge_update applied out of order".into()));
        }
        for rel in &decoded.extents {
            let zone = device.zone(rel.zone_id).ok_or_else(|| Error::Corruption(format!("unknown zone {}", rel.zone_id)))?;
            let extent = metadata::resolve_extent(*rel, zone.start);
            added += extent.length;
            guard.push(extent);
        }
        let new_synced = guard.len();
        drop(guard);
        self.size.fetch_add(added, Ordering::AcqRel);
        self.synced_extent_count.store(new_synced, Ordering::Release);
        Ok(())
    }

    /// Replace this file's attributes and extent list wholesale from a full
    /// snapshot record. Unlike `merge_update`'s append-from-`synced_extent_count`
    /// semantics, a snapshot carries the complete extent list and must
    /// replace, not extend, what's in memory -- the cleaner's `patch_extent`
    /// mutates an existing index rather than appending (`spec.md` §4.4), so
    /// its replacement records can only be replayed correctly as snapshots.
    pub fn apply_snapshot(&self, device: &Arc<ZoneDevice>, decoded: &DecodedFile) -> Result<()> {
        *self.filename.lock().unwrap() = decoded.filename.clone();
        self.lifetime_hint.store(decoded.lifetime_hint, Ordering::Release);

        let mut size = 0u64;
        let mut resolved = Vec::with_capacity(decoded.extents.len());
        for rel in &decoded.extents {
            let zone = device.zone(rel.zone_id).ok_or_else(|| Error::Corruption(format!("unknown zone {}", rel.zone_id)))?;
            let extent = metadata::resolve_extent(*rel, zone.start);
            size += extent.length;
            resolved.push(extent);
        }

        let mut guard = self.extents.write();
        *guard = resolved;
        let new_synced = guard.len();
        drop(guard);
        self.size.store(size, Ordering::Release);
        self.synced_extent_count.store(new_synced, Ordering::Release);
        Ok(())
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn filename(&self) -> String {
        self.filename.lock().unwrap().clone()
    }

    pub fn rename(&self, new_name: String) {
        *self.filename.lock().unwrap() = new_name;
    }

    pub fn size(&self) -> ByteT {
        self.size.load(Ordering::Acquire)
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn smallest_key(&self) -> &[u8] {
        &self.smallest_key
    }

    pub fn largest_key(&self) -> &[u8] {
        &self.largest_key
    }

    pub fn is_sst(&self) -> bool {
        self.is_sst
    }

    pub fn lifetime_hint(&self) -> WriteLifetimeHint {
        self.lifetime_hint.load(Ordering::Acquire)
    }

    pub fn set_write_lifetime_hint(&self, hint: WriteLifetimeHint) {
        self.lifetime_hint.store(hint, Ordering::Release);
    }

    pub fn is_appending(&self) -> bool {
        self.is_appending.load(Ordering::Acquire)
    }

    pub fn mark_for_del(&self) {
        self.marked_for_del.store(true, Ordering::Release);
    }

    pub fn is_marked_for_del(&self) -> bool {
        self.marked_for_del.load(Ordering::Acquire)
    }

    pub fn synced_extent_count(&self) -> usize {
        self.synced_extent_count.load(Ordering::Acquire)
    }

    pub fn metadata_synced(&self) {
        let n = self.extents.read().len();
        self.synced_extent_count.store(n, Ordering::Release);
    }

    pub fn extents_snapshot(&self) -> Vec<Extent> {
        self.extents.read().clone()
    }

    /// Replace one extent with another occupying the same logical slot
    /// (same index, new `{start,length,zone}`). Used by the cleaner after
    /// relocating a still-live extent out of a victim zone (`spec.md`
    /// §4.4).
    pub fn patch_extent(&self, old: Extent, new: Extent) -> Result<()> {
        let mut guard = self.extents.write();
        let slot = guard.iter_mut().find(|e| **e == old).ok_or_else(|| Error::Corruption("patch_extent: extent not found".into()))?;
        *slot = new;
        Ok(())
    }

    fn device(&self) -> Arc<ZoneDevice> {
        self.device.upgrade().expect("ZoneDevice dropped while a ZoneFile outlived it")
    }

    /// Buffer `data_size` block-aligned bytes, of which only the leading
    /// `valid_size` are logical file content, then drain the buffer
    /// immediately via `append_buffer` (`spec.md` §4.2).
    #[instrument(skip(self, data), fields(file = self.file_id, len = data.len()))]
    pub fn append(&self, data: &[u8], valid_size: usize) -> Result<()> {
        self.is_appending.store(true, Ordering::Release);
        self.pending.lock().unwrap().push_back(PendingBuffer { data: data.to_vec(), valid: valid_size });
        self.append_buffer()
    }

    /// Drain pending buffers into `active_zone`, allocating/finalizing
    /// zones as needed (`spec.md` §4.2).
    pub fn append_buffer(&self) -> Result<()> {
        let device = self.device();
        let block_size = device.block_size() as u64;
        loop {
            let mut active = self.active.lock().unwrap();
            let mut pending = self.pending.lock().unwrap();
            let Some(buf) = pending.front_mut() else { return Ok(()) };

            if active.zone.is_none() {
                drop(pending);
                let zone = device.allocate_zone(self.file_id, self.lifetime_hint(), &self.smallest_key, &self.largest_key, self.level)?;
                if self.is_sst {
                    device.record_sst_zone(self.file_id, zone.zone_id);
                }
                active.zone = Some(zone);
                active.extent_start = None;
                active.extent_phys_len = 0;
                continue;
            }
            let zone = active.zone.clone().unwrap();
            let free = zone.free_space();
            if free == 0 {
                self.finalize_extent_locked(&mut active, &zone);
                device.finish_zone(&zone)?;
                device.close_zone_for_write(&zone)?;
                active.zone = None;
                continue;
            }

            // Both `free` and `buf.data.len()` are multiples of
            // `block_size` by contract (the caller block-aligns `data_size`;
            // zone capacity only ever shrinks by whole blocks), so their
            // minimum is too -- no partial-block remainder to round away.
            let fit = (buf.data.len() as u64).min(free);
            let chunk_len = fit as usize;
            let valid_here = buf.valid.min(chunk_len);
            let chunk: Vec<u8> = buf.data.drain(..chunk_len).collect();
            buf.valid -= valid_here;
            let buf_empty = buf.data.is_empty();
            drop(pending);

            let off = zone.append(self.file_id, &chunk, block_size as usize)?;
            if active.extent_start.is_none() {
                active.extent_start = Some(off);
            }
            active.extent_phys_len += chunk.len() as u64;
            self.size.fetch_add(valid_here as u64, Ordering::AcqRel);

            if buf_empty {
                self.pending.lock().unwrap().pop_front();
            }
            if zone.free_space() == 0 {
                self.finalize_extent_locked(&mut active, &zone);
                device.finish_zone(&zone)?;
                device.close_zone_for_write(&zone)?;
                active.zone = None;
            }
        }
    }

    fn finalize_extent_locked(&self, active: &mut ActiveState, zone: &Arc<Zone>) {
        let Some(start) = active.extent_start else { return };
        if active.extent_phys_len == 0 {
            return;
        }
        let extent = Extent::new(zone.zone_id, start, active.extent_phys_len);
        self.extents.write().push(extent);
        zone.record_extent(ExtentInfo {
            extent,
            owning_file: self.file_id,
            valid: true,
            filename: self.filename(),
            lifetime_hint: self.lifetime_hint(),
            level: self.level,
        });
        zone.update_secondary_lifetime(self.lifetime_hint(), active.extent_phys_len);
        debug!(file = self.file_id, zone = zone.zone_id, len = active.extent_phys_len, "pushed extent");
        active.extent_start = None;
        active.extent_phys_len = 0;
    }

    /// Finish whatever is buffered on the active zone and release it
    /// (`spec.md` §4.2 `close_wr`).
    pub fn close_wr(&self) -> Result<()> {
        let device = self.device();
        let mut active = self.active.lock().unwrap();
        if let Some(zone) = active.zone.clone() {
            self.finalize_extent_locked(&mut active, &zone);
            device.close_zone_for_write(&zone)?;
            active.zone = None;
        }
        self.is_appending.store(false, Ordering::Release);
        Ok(())
    }

    /// Locate the extent(s) covering `[offset, offset+buf.len())` and read
    /// them. May return fewer bytes than requested at EOF (`spec.md` §4.2
    /// `positioned_read`).
    #[instrument(skip(self, buf), fields(file = self.file_id, offset, len = buf.len()))]
    pub fn positioned_read(&self, offset: ByteT, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let guard = self.extents.read();
        let mut remaining = want;
        let mut out_pos = 0usize;
        let mut logical_offset = 0u64;
        for extent in guard.iter() {
            let extent_end = logical_offset + extent.length;
            if remaining == 0 {
                break;
            }
            if extent_end <= offset {
                logical_offset = extent_end;
                continue;
            }
            let start_within = offset.max(logical_offset) - logical_offset;
            let avail = (extent.length - start_within).min(remaining as u64);
            let device_offset = extent.start + start_within;
            let zone = self.device().zone(extent.zone).ok_or(Error::Corruption("dangling zone reference".into()))?;
            let n = zone.read_at(device_offset - zone.start, &mut buf[out_pos..out_pos + avail as usize])?;
            out_pos += n;
            remaining -= n;
            logical_offset = extent_end;
            if n < avail as usize {
                break;
            }
        }
        Ok(out_pos)
    }
}
