// vim: tw=80
//! The thin writable- and readable-file facades exposed to the engine
//! (`spec.md` §4.5, §6 "File API surface").
//!
//! `ZonedWritableFile` is deliberately dumb: it only knows how to buffer
//! unaligned application writes into block-aligned chunks and hand them to
//! `ZoneFile`. All the interesting decisions (which zone, when to roll,
//! how to invalidate) live below it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::instrument;

use crate::device::ZoneDevice;
use crate::error::{Error, Result};
use crate::file::ZoneFile;
use crate::lifetime::WriteLifetimeHint;
use crate::metadata::{self, MetadataWriter};
use crate::types::ByteT;
use crate::unique_id::UniqueId;

pub struct ZonedWritableFile {
    file: Arc<ZoneFile>,
    device: Arc<ZoneDevice>,
    metadata_writer: Arc<dyn MetadataWriter>,
    buffer_sz: usize,
    staging: Mutex<Vec<u8>>,
    generation: u64,
}

impl ZonedWritableFile {
    pub fn new(device: Arc<ZoneDevice>, file: Arc<ZoneFile>, metadata_writer: Arc<dyn MetadataWriter>, buffer_sz: usize) -> Self {
        ZonedWritableFile { file, device, metadata_writer, buffer_sz, staging: Mutex::new(Vec::new()), generation: 0 }
    }

    fn logical_size(&self) -> ByteT {
        self.file.size() + self.staging.lock().unwrap().len() as ByteT
    }

    /// Append application bytes, flushing complete `buffer_sz` chunks to
    /// `ZoneFile::append` as they fill (`spec.md` §4.5).
    #[instrument(skip(self, data), fields(file = self.file.file_id(), len = data.len()))]
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut staging = self.staging.lock().unwrap();
        staging.extend_from_slice(data);
        while staging.len() >= self.buffer_sz {
            let chunk: Vec<u8> = staging.drain(..self.buffer_sz).collect();
            drop(staging);
            self.file.append(&chunk, chunk.len())?;
            staging = self.staging.lock().unwrap();
        }
        Ok(())
    }

    /// Append-only: `offset` must equal the file's current logical size
    /// (`spec.md` §4.5, §6).
    pub fn positioned_append(&self, data: &[u8], offset: ByteT) -> Result<()> {
        if offset != self.logical_size() {
            return Err(Error::NotSupported("positioned_append at an offset other than the current file size"));
        }
        self.append(data)
    }

    /// Grow-to-same-size truncate is a no-op; any other size is
    /// unsupported (`spec.md` §4.5).
    pub fn truncate(&self, size: ByteT) -> Result<()> {
        if size == self.logical_size() {
            Ok(())
        } else {
            Err(Error::NotSupported("truncate to a size other than the current file size"))
        }
    }

    /// Pad and flush whatever's in the staging buffer to the device,
    /// without persisting metadata.
    pub fn flush(&self) -> Result<()> {
        let block_size = self.device.block_size();
        let mut staging = self.staging.lock().unwrap();
        if staging.is_empty() {
            return Ok(());
        }
        let valid_size = staging.len();
        let padded_len = crate::types::round_up(valid_size as u64, block_size as u64) as usize;
        staging.resize(padded_len, 0);
        let data = std::mem::take(&mut *staging);
        drop(staging);
        self.file.append(&data, valid_size)
    }

    /// `flush` plus a durable metadata journal record (`spec.md` §6
    /// "Metadata journal contract").
    pub fn sync(&self) -> Result<()> {
        self.flush()?;
        self.persist_update()
    }

    /// Alias kept distinct from `sync` at the API surface (`spec.md` §6
    /// lists both `sync` and `fsync`); this crate makes no distinction
    /// between the two since there is no separate metadata-only sync path.
    pub fn fsync(&self) -> Result<()> {
        self.sync()
    }

    /// Persist a subset of already-durable extents again. Since this crate
    /// has no partial/O_DIRECT range concept beyond whole extents, this is
    /// `sync` in practice.
    pub fn range_sync(&self, _offset: ByteT, _n: ByteT) -> Result<()> {
        self.sync()
    }

    pub fn set_write_lifetime_hint(&self, hint: WriteLifetimeHint) {
        self.file.set_write_lifetime_hint(hint);
    }

    pub fn get_required_buffer_alignment(&self) -> usize {
        self.device.block_size()
    }

    /// Flush, push the final extent, release the active zone, and persist
    /// the file's metadata record (`spec.md` §4.5 `close`).
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.file.close_wr()?;
        self.persist_update()
    }

    fn persist_update(&self) -> Result<()> {
        let device = self.device.clone();
        let record = metadata::encode_update_to(&self.file, |zone_id| {
            device.zone(zone_id).map(|z| z.start).unwrap_or(0)
        });
        self.metadata_writer.persist(&record)?;
        self.file.metadata_synced();
        Ok(())
    }

    pub fn unique_id(&self) -> UniqueId {
        UniqueId::new(self.file.file_id(), self.generation)
    }
}

/// Shared by the sequential- and random-read facades: both ultimately
/// translate to `ZoneFile::positioned_read` (`spec.md` §6).
pub struct ZonedRandomAccessFile {
    file: Arc<ZoneFile>,
}

impl ZonedRandomAccessFile {
    pub fn new(file: Arc<ZoneFile>) -> Self {
        ZonedRandomAccessFile { file }
    }

    pub fn positioned_read(&self, offset: ByteT, buf: &mut [u8]) -> Result<usize> {
        self.file.positioned_read(offset, buf)
    }

    pub fn unique_id(&self) -> UniqueId {
        UniqueId::new(self.file.file_id(), 0)
    }
}

pub struct ZonedSequentialFile {
    file: Arc<ZoneFile>,
    pos: AtomicU64,
}

impl ZonedSequentialFile {
    pub fn new(file: Arc<ZoneFile>) -> Self {
        ZonedSequentialFile { file, pos: AtomicU64::new(0) }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.pos.load(Ordering::Acquire);
        let n = self.file.positioned_read(pos, buf)?;
        self.pos.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    pub fn skip(&self, n: ByteT) {
        self.pos.fetch_add(n, Ordering::AcqRel);
    }

    pub fn positioned_read(&self, offset: ByteT, buf: &mut [u8]) -> Result<usize> {
        self.file.positioned_read(offset, buf)
    }

    pub fn unique_id(&self) -> UniqueId {
        UniqueId::new(self.file.file_id(), 0)
    }
}

#[cfg(test)]
mod t {
    use super::*;
    use crate::device::ZoneDeviceConfig;
    use crate::device_contract::{BlockDevice, MemBlockDevice};

    struct NullMetadataWriter;
    impl MetadataWriter for NullMetadataWriter {
        fn persist(&self, _record: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn device() -> Arc<ZoneDevice> {
        let d: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4, 1, 1 << 20, 4096));
        Arc::new(ZoneDevice::open(d, ZoneDeviceConfig { max_active: 8, max_open: 8, reserved_zones: 1 }).unwrap())
    }

    mod append {
        use super::*;

        #[test]
        fn unaligned_writes_accumulate_then_flush_on_fill() {
            let dev = device();
            let file = ZoneFile::new(&dev, dev.next_file_id(), "w.sst".into(), WriteLifetimeHint::Short, 0, b"a".to_vec(), b"z".to_vec(), true);
            let w = ZonedWritableFile::new(dev.clone(), file.clone(), Arc::new(NullMetadataWriter), 4096);
            w.append(&[1u8; 3000]).unwrap();
            assert_eq!(file.size(), 0); // not yet a full block
            w.append(&[2u8; 2000]).unwrap();
            assert_eq!(file.size(), 4096); // one full block flushed
        }

        #[test]
        fn close_flushes_remainder_with_padding() {
            let dev = device();
            let file = ZoneFile::new(&dev, dev.next_file_id(), "w2.sst".into(), WriteLifetimeHint::Short, 0, b"a".to_vec(), b"z".to_vec(), true);
            let w = ZonedWritableFile::new(dev.clone(), file.clone(), Arc::new(NullMetadataWriter), 4096);
            w.append(&[1u8; 100]).unwrap();
            w.close().unwrap();
            assert_eq!(file.size(), 100);
        }
    }

    #[test]
    fn truncate_to_current_size_is_a_noop() {
        let dev = device();
        let file = ZoneFile::new(&dev, dev.next_file_id(), "t.sst".into(), WriteLifetimeHint::Short, 0, b"a".to_vec(), b"z".to_vec(), true);
        let w = ZonedWritableFile::new(dev.clone(), file, Arc::new(NullMetadataWriter), 4096);
        assert!(w.truncate(0).is_ok());
        assert!(w.truncate(1).is_err());
    }

    #[test]
    fn positioned_append_rejects_non_current_offset() {
        let dev = device();
        let file = ZoneFile::new(&dev, dev.next_file_id(), "p.sst".into(), WriteLifetimeHint::Short, 0, b"a".to_vec(), b"z".to_vec(), true);
        let w = ZonedWritableFile::new(dev.clone(), file, Arc::new(NullMetadataWriter), 4096);
        assert!(matches!(w.positioned_append(b"x", 5), Err(Error::NotSupported(_))));
        assert!(w.positioned_append(b"x", 0).is_ok());
    }
}
