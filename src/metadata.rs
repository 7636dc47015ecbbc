// vim: tw=80
//! The metadata journal wire format and the `MetadataWriter` contract
//! (`spec.md` §6 "Metadata record format", §6 "Metadata journal contract").
//!
//! A flat tagged `(tag, length, value)` sequence per file, varint-encoded,
//! in the spirit of the length-prefixed records `bfffs-core`'s own on-disk
//! label and BTree node codecs use -- but hand-rolled here rather than via
//! `bincode`/`serde`, since the format is explicitly required to be
//! self-describing and forward-tolerant of unknown *optional* tags while
//! still rejecting unknown *required* ones (no derive macro expresses that
//! distinction directly).

use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::file::ZoneFile;
use crate::lifetime::WriteLifetimeHint;
use crate::types::{ByteT, FileId, Level, ZoneId};

const TAG_FILE_ID: u8 = 1;
const TAG_FILENAME: u8 = 2;
const TAG_LIFETIME_HINT: u8 = 3;
const TAG_LEVEL: u8 = 4;
const TAG_SMALLEST_KEY: u8 = 5;
const TAG_LARGEST_KEY: u8 = 6;
const TAG_IS_SST: u8 = 7;
const TAG_EXTENT: u8 = 8;
/// `1` if this record is a full snapshot (`encode_snapshot_to`, extents from
/// index 0), `0` if it's an incremental update (`encode_update_to`, extents
/// from `synced_extent_count` on). A replayer must apply the two
/// differently: a snapshot replaces a file's extent list wholesale, an
/// update appends to it.
const TAG_IS_SNAPSHOT: u8 = 9;

/// Tags a decoder must understand to accept a record at all. An unknown tag
/// outside this set is skipped (forward compatibility); one of these
/// missing or malformed is `CORRUPTION`.
const REQUIRED_TAGS: &[u8] = &[TAG_FILE_ID, TAG_FILENAME, TAG_LEVEL, TAG_IS_SST];

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        } else {
            out.push(byte | 0x80);
        }
    }
}

fn read_varint(input: &mut &[u8]) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let &byte = input.first().ok_or_else(|| Error::Corruption("truncated varint".into()))?;
        *input = &input[1..];
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::Corruption("varint too long".into()));
        }
    }
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    write_varint(out, tag as u64);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn read_tlv(input: &mut &[u8]) -> Result<Option<(u8, Vec<u8>)>> {
    if input.is_empty() {
        return Ok(None);
    }
    let tag = read_varint(input)? as u8;
    let len = read_varint(input)? as usize;
    if input.len() < len {
        return Err(Error::Corruption("TLV value runs past end of record".into()));
    }
    let value = input[..len].to_vec();
    *input = &input[len..];
    Ok(Some((tag, value)))
}

/// A decoded extent, zone-relative (`spec.md` §6: "`start_in_zone` is
/// relative so that zone relocation remains possible in principle").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelativeExtent {
    pub zone_id: ZoneId,
    pub start_in_zone: ByteT,
    pub length: ByteT,
}

#[derive(Clone, Debug)]
pub struct DecodedFile {
    pub file_id: FileId,
    pub filename: String,
    pub lifetime_hint: WriteLifetimeHint,
    pub level: Level,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub is_sst: bool,
    pub extents: Vec<RelativeExtent>,
    pub is_snapshot: bool,
}

/// Encode `file`'s attributes plus `extents[first_extent_index..]` as one
/// TLV record, with each extent's start made zone-relative via
/// `zone_start`. `encode_update_to`/`encode_snapshot_to` are thin callers
/// with `first_extent_index` set to `synced_extent_count` or `0`
/// respectively.
pub fn encode_update_to(file: &ZoneFile, zone_start: impl Fn(ZoneId) -> ByteT) -> Vec<u8> {
    encode_relative(file, file.synced_extent_count(), false, zone_start)
}

pub fn encode_snapshot_to(file: &ZoneFile, zone_start: impl Fn(ZoneId) -> ByteT) -> Vec<u8> {
    encode_relative(file, 0, true, zone_start)
}

/// `Extent::start` is an absolute device offset; the wire format stores
/// zone-relative offsets, so this subtracts each extent's zone start
/// before TLV-encoding it.
fn encode_relative(file: &ZoneFile, first_extent_index: usize, is_snapshot: bool, zone_start: impl Fn(ZoneId) -> ByteT) -> Vec<u8> {
    let mut out = Vec::new();
    write_tlv(&mut out, TAG_FILE_ID, &file.file_id().to_le_bytes());
    write_tlv(&mut out, TAG_FILENAME, file.filename().as_bytes());
    write_tlv(&mut out, TAG_LIFETIME_HINT, &[file.lifetime_hint() as u8]);
    write_tlv(&mut out, TAG_LEVEL, &[file.level()]);
    write_tlv(&mut out, TAG_SMALLEST_KEY, file.smallest_key());
    write_tlv(&mut out, TAG_LARGEST_KEY, file.largest_key());
    write_tlv(&mut out, TAG_IS_SST, &[file.is_sst() as u8]);
    write_tlv(&mut out, TAG_IS_SNAPSHOT, &[is_snapshot as u8]);
    for extent in file.extents_snapshot().into_iter().skip(first_extent_index) {
        let mut ev = Vec::new();
        write_varint(&mut ev, extent.zone as u64);
        write_varint(&mut ev, extent.start - zone_start(extent.zone));
        write_varint(&mut ev, extent.length);
        write_tlv(&mut out, TAG_EXTENT, &ev);
    }
    out
}

/// Inverse of `encode_update_to`/`encode_snapshot_to`. Rejects unknown
/// required tags and truncated/malformed TLVs as `CORRUPTION`
/// (`spec.md` §6: "Decoders MUST reject unknown required tags").
pub fn decode_from(mut input: &[u8]) -> Result<DecodedFile> {
    let mut file_id = None;
    let mut filename = None;
    let mut lifetime_hint = WriteLifetimeHint::NotSet;
    let mut level = None;
    let mut smallest_key = Vec::new();
    let mut largest_key = Vec::new();
    let mut is_sst = None;
    let mut is_snapshot = false;
    let mut extents = Vec::new();

    while let Some((tag, value)) = read_tlv(&mut input)? {
        match tag {
            TAG_FILE_ID => {
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corruption("file_id tag has wrong width".into()))?;
                file_id = Some(u64::from_le_bytes(bytes));
            }
            TAG_FILENAME => {
                filename = Some(String::from_utf8(value).map_err(|_| Error::Corruption("filename is not valid UTF-8".into()))?);
            }
            TAG_LIFETIME_HINT => {
                lifetime_hint = decode_lifetime_hint(value.first().copied())?;
            }
            TAG_LEVEL => {
                level = value.first().copied();
            }
            TAG_SMALLEST_KEY => smallest_key = value,
            TAG_LARGEST_KEY => largest_key = value,
            TAG_IS_SST => {
                is_sst = value.first().map(|&b| b != 0);
            }
            TAG_IS_SNAPSHOT => {
                is_snapshot = value.first().copied().unwrap_or(0) != 0;
            }
            TAG_EXTENT => {
                let mut v = value.as_slice();
                let zone_id = read_varint(&mut v)? as ZoneId;
                let start_in_zone = read_varint(&mut v)?;
                let length = read_varint(&mut v)?;
                extents.push(RelativeExtent { zone_id, start_in_zone, length });
            }
            _ => { /* unknown optional tag: forward-compatible skip */ }
        }
    }

    for &tag in REQUIRED_TAGS {
        let present = match tag {
            TAG_FILE_ID => file_id.is_some(),
            TAG_FILENAME => filename.is_some(),
            TAG_LEVEL => level.is_some(),
            TAG_IS_SST => is_sst.is_some(),
            _ => true,
        };
        if !present {
            return Err(Error::Corruption(format!("missing required tag {tag}")));
        }
    }

    Ok(DecodedFile {
        file_id: file_id.unwrap(),
        filename: filename.unwrap(),
        lifetime_hint,
        level: level.unwrap(),
        smallest_key,
        largest_key,
        is_sst: is_sst.unwrap(),
        extents,
        is_snapshot,
    })
}

fn decode_lifetime_hint(byte: Option<u8>) -> Result<WriteLifetimeHint> {
    match byte {
        Some(0) => Ok(WriteLifetimeHint::NotSet),
        Some(1) => Ok(WriteLifetimeHint::Short),
        Some(2) => Ok(WriteLifetimeHint::Medium),
        Some(3) => Ok(WriteLifetimeHint::Long),
        Some(4) => Ok(WriteLifetimeHint::Extreme),
        _ => Err(Error::Corruption("invalid lifetime_hint tag".into())),
    }
}

/// Resolve a [`RelativeExtent`] back to an absolute [`Extent`] via the
/// device's `id_to_zone` registry (`decode_from`'s job per `spec.md` §4.2).
pub fn resolve_extent(rel: RelativeExtent, zone_start: ByteT) -> Extent {
    Extent::new(rel.zone_id, zone_start + rel.start_in_zone, rel.length)
}

/// The external journal collaborator (`spec.md` §6 "Metadata journal
/// contract (consumed)"). `persist` must be durable on return and totally
/// order records across all callers.
pub trait MetadataWriter: Send + Sync {
    fn persist(&self, record: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn varint_round_trips() {
        for v in [0u64, 1, 127, 128, 300, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let mut slice = buf.as_slice();
            assert_eq!(read_varint(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn decode_rejects_missing_required_tag() {
        let mut out = Vec::new();
        write_tlv(&mut out, TAG_FILENAME, b"f");
        assert!(matches!(decode_from(&out), Err(Error::Corruption(_))));
    }

    #[test]
    fn decode_skips_unknown_optional_tags() {
        let mut out = Vec::new();
        write_tlv(&mut out, TAG_FILE_ID, &7u64.to_le_bytes());
        write_tlv(&mut out, TAG_FILENAME, b"f");
        write_tlv(&mut out, TAG_LEVEL, &[2]);
        write_tlv(&mut out, TAG_IS_SST, &[1]);
        write_tlv(&mut out, 99, b"from the future");
        let decoded = decode_from(&out).unwrap();
        assert_eq!(decoded.file_id, 7);
        assert_eq!(decoded.filename, "f");
    }
}
