//! Multi-pack-index reader.
//!
//! One `multi-pack-index` file maps object ids to (pack, offset) pairs across
//! every pack it covers, so lookup cost stays logarithmic as maintenance
//! accumulates packs. Chunks follow the Git layout: PNAM (pack names), OIDF
//! (fanout), OIDL (sorted ids), OOFF (pack id + offset), LOFF (large offsets).

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

use crate::{errors::GvfsError, oid::ObjectId};

const MIDX_MAGIC: &[u8; 4] = b"MIDX";
const CHUNK_PACK_NAMES: u32 = u32::from_be_bytes(*b"PNAM");
const CHUNK_OID_FANOUT: u32 = u32::from_be_bytes(*b"OIDF");
const CHUNK_OID_LOOKUP: u32 = u32::from_be_bytes(*b"OIDL");
const CHUNK_OBJECT_OFFSETS: u32 = u32::from_be_bytes(*b"OOFF");
const CHUNK_LARGE_OFFSETS: u32 = u32::from_be_bytes(*b"LOFF");

/// Position of an object according to the multi-pack-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidxEntry {
    /// Index into [`MidxFile::pack_names`].
    pub pack_id: u32,
    /// Byte offset of the entry within that pack.
    pub offset: u64,
}

/// A memory-mapped `multi-pack-index`.
pub struct MidxFile {
    path: PathBuf,
    map: Mmap,
    object_count: usize,
    pack_names: Vec<String>,
    fanout_at: usize,
    lookup_at: usize,
    offsets_at: usize,
    large_at: Option<usize>,
}

impl MidxFile {
    pub fn open(path: &Path) -> Result<MidxFile, GvfsError> {
        let file = std::fs::File::open(path)?;
        // Safety: read-only map; maintenance replaces the file by rename.
        let map = unsafe { Mmap::map(&file)? };
        Self::from_map(path.to_path_buf(), map)
    }

    fn from_map(path: PathBuf, map: Mmap) -> Result<MidxFile, GvfsError> {
        let display = path.display().to_string();
        if map.len() < 12 {
            return Err(GvfsError::InvalidPackIndex(display));
        }
        if &map[..4] != MIDX_MAGIC || map[4] != 1 || map[5] != 1 {
            // version 1, SHA-1 object format
            return Err(GvfsError::InvalidPackIndex(display));
        }
        let chunk_count = map[6] as usize;
        let pack_count = BigEndian::read_u32(&map[8..12]) as usize;

        // Chunk lookup table: chunk_count + 1 rows of (id: u32, offset: u64),
        // terminated by a zero id pointing at the trailing checksum.
        let table_at = 12;
        let table_len = (chunk_count + 1) * 12;
        if map.len() < table_at + table_len {
            return Err(GvfsError::InvalidPackIndex(display));
        }

        let mut pack_names_at = None;
        let mut fanout_at = None;
        let mut lookup_at = None;
        let mut offsets_at = None;
        let mut large_at = None;
        for i in 0..chunk_count {
            let row = table_at + i * 12;
            let id = BigEndian::read_u32(&map[row..]);
            let offset = BigEndian::read_u64(&map[row + 4..]) as usize;
            if offset > map.len() {
                return Err(GvfsError::InvalidPackIndex(display));
            }
            match id {
                CHUNK_PACK_NAMES => pack_names_at = Some(offset),
                CHUNK_OID_FANOUT => fanout_at = Some(offset),
                CHUNK_OID_LOOKUP => lookup_at = Some(offset),
                CHUNK_OBJECT_OFFSETS => offsets_at = Some(offset),
                CHUNK_LARGE_OFFSETS => large_at = Some(offset),
                _ => {} // unknown optional chunk, skip
            }
        }
        let (Some(pack_names_at), Some(fanout_at), Some(lookup_at), Some(offsets_at)) =
            (pack_names_at, fanout_at, lookup_at, offsets_at)
        else {
            return Err(GvfsError::InvalidPackIndex(display));
        };
        if fanout_at + 256 * 4 > map.len() {
            return Err(GvfsError::InvalidPackIndex(display));
        }
        let object_count = BigEndian::read_u32(&map[fanout_at + 255 * 4..]) as usize;
        if lookup_at + object_count * 20 > map.len()
            || offsets_at + object_count * 8 > map.len()
        {
            return Err(GvfsError::InvalidPackIndex(display));
        }

        let mut pack_names = Vec::with_capacity(pack_count);
        let mut cursor = pack_names_at;
        for _ in 0..pack_count {
            let rest = &map[cursor..];
            let Some(nul) = memchr::memchr(0, rest) else {
                return Err(GvfsError::InvalidPackIndex(display));
            };
            let name = std::str::from_utf8(&rest[..nul])
                .map_err(|_| GvfsError::InvalidPackIndex(display.clone()))?;
            pack_names.push(name.to_string());
            cursor += nul + 1;
        }

        Ok(MidxFile {
            path,
            map,
            object_count,
            pack_names,
            fanout_at,
            lookup_at,
            offsets_at,
            large_at,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// The covered pack idx file names, in the order `pack_id` indexes them.
    pub fn pack_names(&self) -> &[String] {
        &self.pack_names
    }

    pub fn oid_at(&self, i: usize) -> ObjectId {
        let start = self.lookup_at + i * 20;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&self.map[start..start + 20]);
        ObjectId(bytes)
    }

    fn fanout(&self, byte: u8) -> (usize, usize) {
        let lo = if byte == 0 {
            0
        } else {
            BigEndian::read_u32(&self.map[self.fanout_at + (byte as usize - 1) * 4..]) as usize
        };
        let hi = BigEndian::read_u32(&self.map[self.fanout_at + byte as usize * 4..]) as usize;
        (lo, hi)
    }

    fn entry_at(&self, i: usize) -> Result<MidxEntry, GvfsError> {
        let row = self.offsets_at + i * 8;
        let pack_id = BigEndian::read_u32(&self.map[row..]);
        let raw = BigEndian::read_u32(&self.map[row + 4..]);
        let offset = if raw & 0x8000_0000 == 0 {
            raw as u64
        } else {
            let large_at = self
                .large_at
                .ok_or_else(|| GvfsError::InvalidPackIndex(self.path.display().to_string()))?;
            let slot = large_at + (raw & 0x7FFF_FFFF) as usize * 8;
            if slot + 8 > self.map.len() {
                return Err(GvfsError::InvalidPackIndex(self.path.display().to_string()));
            }
            BigEndian::read_u64(&self.map[slot..])
        };
        Ok(MidxEntry { pack_id, offset })
    }

    /// Locate `oid` across all covered packs.
    pub fn lookup(&self, oid: &ObjectId) -> Result<Option<MidxEntry>, GvfsError> {
        let (mut lo, mut hi) = self.fanout(oid.first_byte());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_at(mid).cmp(oid) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(self.entry_at(mid)?)),
            }
        }
        Ok(None)
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        matches!(self.lookup(oid), Ok(Some(_)))
    }
}
