// vim: tw=80
//! A zone allocator, extent-mapped file abstraction, and zone cleaner for a
//! log-structured key-value engine backed by a Zoned Block Device.
//!
//! The three load-bearing pieces are [`zone::Zone`] (one physical zone's
//! state machine), [`device::ZoneDevice`] (the zone pool, allocation
//! policy, and device-wide concurrency caps), and [`file::ZoneFile`] (the
//! append-only extent list one logical file is made of). [`cleaner`]
//! reclaims zones dominated by invalidated data; [`writable_file`] and
//! [`metadata`] are the thin facades the engine and the on-disk journal
//! actually see.
//!
//! Everything outside this crate -- the LSM engine, the metadata journal's
//! own on-disk layout, the POSIX-shaped file API shim, and the raw device
//! driver -- is a collaborator reached only through [`device_contract`] and
//! [`metadata::MetadataWriter`].

pub mod allocator;
pub mod cleaner;
pub mod device;
pub mod device_contract;
pub mod error;
pub mod extent;
pub mod extent_lock;
pub mod file;
pub mod lifetime;
pub mod metadata;
pub mod types;
pub mod unique_id;
pub mod writable_file;
pub mod zone;

pub use error::{Error, Result};

use std::sync::Arc;

use tracing::instrument;

use crate::device::{ZoneDevice, ZoneDeviceConfig};
use crate::device_contract::BlockDevice;
use crate::file::ZoneFile;
use crate::lifetime::WriteLifetimeHint;
use crate::metadata::MetadataWriter;
use crate::types::{ByteT, FileId, Level};
use crate::writable_file::{ZonedRandomAccessFile, ZonedSequentialFile, ZonedWritableFile};

/// The facade an embedding key-value engine actually opens files through:
/// owns the [`ZoneDevice`] and wires new files to it, the way `bfffs-core`'s
/// `Database` sits atop its `Pool`/`IDML` stack.
pub struct ZoneFileSystem {
    device: Arc<ZoneDevice>,
    metadata_writer: Arc<dyn MetadataWriter>,
    buffer_sz: usize,
}

impl ZoneFileSystem {
    #[instrument(skip(block_device, metadata_writer))]
    pub fn open(
        block_device: Arc<dyn BlockDevice>,
        config: ZoneDeviceConfig,
        metadata_writer: Arc<dyn MetadataWriter>,
    ) -> Result<Self> {
        let buffer_sz = block_device.block_size();
        let device = Arc::new(ZoneDevice::open(block_device, config)?);
        Ok(ZoneFileSystem { device, metadata_writer, buffer_sz })
    }

    pub fn device(&self) -> &Arc<ZoneDevice> {
        &self.device
    }

    /// Replay every record a caller hands us from the metadata journal,
    /// reconstructing the file registry (`spec.md` §8 scenario 6,
    /// "Crash-consistent metadata"). Each `record` should be exactly one
    /// `encode_snapshot_to`/`encode_update_to` payload, in journal order.
    pub fn replay(&self, records: impl IntoIterator<Item = Vec<u8>>) -> Result<()> {
        for record in records {
            let decoded = metadata::decode_from(&record)?;
            match self.device.lookup_file(decoded.file_id) {
                Some(existing) if decoded.is_snapshot => existing.apply_snapshot(&self.device, &decoded)?,
                Some(existing) => existing.merge_update(&self.device, &decoded)?,
                None => {
                    let file = ZoneFile::from_decoded(&self.device, &decoded)?;
                    for extent in file.extents_snapshot() {
                        self.device.record_sst_zone(decoded.file_id, extent.zone);
                    }
                    self.device.register_file(file);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_writable_file(
        &self,
        filename: impl Into<String>,
        lifetime_hint: WriteLifetimeHint,
        level: Level,
        smallest_key: Vec<u8>,
        largest_key: Vec<u8>,
        is_sst: bool,
    ) -> ZonedWritableFile {
        let file_id = self.device.next_file_id();
        let file = ZoneFile::new(&self.device, file_id, filename.into(), lifetime_hint, level, smallest_key, largest_key, is_sst);
        self.device.register_file(file.clone());
        ZonedWritableFile::new(self.device.clone(), file, self.metadata_writer.clone(), self.buffer_sz)
    }

    pub fn open_sequential_file(&self, file_id: FileId) -> Option<ZonedSequentialFile> {
        self.device.lookup_file(file_id).map(ZonedSequentialFile::new)
    }

    pub fn open_random_access_file(&self, file_id: FileId) -> Option<ZonedRandomAccessFile> {
        self.device.lookup_file(file_id).map(ZonedRandomAccessFile::new)
    }

    /// Invalidate every extent of `file_id` and drop it from the registry.
    /// Real deletion of the bytes only happens once the cleaner resets the
    /// zones they lived in.
    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        let Some(file) = self.device.unregister_file(file_id) else { return Ok(()) };
        file.mark_for_del();
        for extent in file.extents_snapshot() {
            if let Some(zone) = self.device.zone(extent.zone) {
                zone.invalidate(extent);
            }
        }
        Ok(())
    }

    pub fn rename_file(&self, file_id: FileId, new_name: impl Into<String>) -> Result<()> {
        match self.device.lookup_file(file_id) {
            Some(file) => {
                file.rename(new_name.into());
                Ok(())
            }
            None => Err(Error::Corruption(format!("rename_file: unknown file {file_id}"))),
        }
    }

    /// Run one cleaner pass, reclaiming up to `k` zones (`spec.md` §4.4).
    pub fn run_cleaner(&self, k: usize) -> Result<usize> {
        cleaner::zone_cleaning(&self.device, k, self.metadata_writer.as_ref())
    }

    pub fn shutdown(&self) {
        self.device.shutdown();
    }

    pub fn free_space(&self) -> ByteT {
        self.device.free_space()
    }
}
