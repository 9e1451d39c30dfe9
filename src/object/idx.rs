//! Pack index (.idx) v2 reader.
//!
//! The layout is the one our pack installer (and Git) writes: magic
//! `\xFF t O c`, version 2, 256-entry cumulative fanout, sorted object names,
//! CRC32 column, 31-bit offsets with an overflow table for huge packs, and a
//! 2-hash trailer. Lookups are a fanout slice plus binary search, which keeps
//! `has_object` logarithmic in packed-object count.

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

use crate::{errors::GvfsError, oid::ObjectId};

const IDX_MAGIC: [u8; 4] = [0xFF, 0x74, 0x4F, 0x63];
const FANOUT_LEN: usize = 256 * 4;
const HEADER_LEN: usize = 8;

/// A memory-mapped pack index.
pub struct IdxFile {
    path: PathBuf,
    map: Mmap,
    object_count: usize,
}

impl IdxFile {
    /// Map an idx file and validate its framing.
    pub fn open(path: &Path) -> Result<IdxFile, GvfsError> {
        let file = std::fs::File::open(path)?;
        // Safety: the mapping is read-only and pack indexes are immutable
        // once installed (writers rename a finished file into place).
        let map = unsafe { Mmap::map(&file)? };
        Self::from_map(path.to_path_buf(), map)
    }

    fn from_map(path: PathBuf, map: Mmap) -> Result<IdxFile, GvfsError> {
        let display = path.display().to_string();
        if map.len() < HEADER_LEN + FANOUT_LEN + 40 {
            return Err(GvfsError::InvalidPackIndex(display));
        }
        if map[..4] != IDX_MAGIC || BigEndian::read_u32(&map[4..8]) != 2 {
            return Err(GvfsError::InvalidPackIndex(display));
        }
        let fanout_end = HEADER_LEN + FANOUT_LEN;
        let object_count = BigEndian::read_u32(&map[fanout_end - 4..fanout_end]) as usize;

        // names + crc32 + offsets + two trailer hashes must fit.
        let minimum = fanout_end + object_count * (20 + 4 + 4) + 40;
        if map.len() < minimum {
            return Err(GvfsError::InvalidPackIndex(display));
        }
        Ok(IdxFile {
            path,
            map,
            object_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    fn fanout(&self, byte: u8) -> (usize, usize) {
        let base = HEADER_LEN;
        let lo = if byte == 0 {
            0
        } else {
            BigEndian::read_u32(&self.map[base + (byte as usize - 1) * 4..]) as usize
        };
        let hi = BigEndian::read_u32(&self.map[base + byte as usize * 4..]) as usize;
        (lo, hi)
    }

    fn names_start(&self) -> usize {
        HEADER_LEN + FANOUT_LEN
    }

    fn crc_start(&self) -> usize {
        self.names_start() + self.object_count * 20
    }

    fn offsets_start(&self) -> usize {
        self.crc_start() + self.object_count * 4
    }

    fn large_offsets_start(&self) -> usize {
        self.offsets_start() + self.object_count * 4
    }

    /// The object id at sorted position `i`.
    pub fn oid_at(&self, i: usize) -> ObjectId {
        let start = self.names_start() + i * 20;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&self.map[start..start + 20]);
        ObjectId(bytes)
    }

    /// CRC32 of the compressed pack entry at sorted position `i`.
    pub fn crc_at(&self, i: usize) -> u32 {
        BigEndian::read_u32(&self.map[self.crc_start() + i * 4..])
    }

    /// Pack offset of the object at sorted position `i`, following the
    /// large-offset indirection when the 31-bit slot overflows.
    pub fn offset_at(&self, i: usize) -> Result<u64, GvfsError> {
        let raw = BigEndian::read_u32(&self.map[self.offsets_start() + i * 4..]);
        if raw & 0x8000_0000 == 0 {
            return Ok(raw as u64);
        }
        let large_index = (raw & 0x7FFF_FFFF) as usize;
        let start = self.large_offsets_start() + large_index * 8;
        if start + 8 > self.map.len() - 40 {
            return Err(GvfsError::InvalidPackIndex(self.path.display().to_string()));
        }
        Ok(BigEndian::read_u64(&self.map[start..]))
    }

    /// Binary search within the fanout bucket for `oid`. Returns its sorted
    /// position when present.
    pub fn position_of(&self, oid: &ObjectId) -> Option<usize> {
        let (mut lo, mut hi) = self.fanout(oid.first_byte());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_at(mid).cmp(oid) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.position_of(oid).is_some()
    }

    /// Pack offset for `oid`, if this index covers it.
    pub fn offset_of(&self, oid: &ObjectId) -> Result<Option<u64>, GvfsError> {
        match self.position_of(oid) {
            Some(i) => Ok(Some(self.offset_at(i)?)),
            None => Ok(None),
        }
    }

    /// Hash of the pack file this index covers (first trailer hash).
    pub fn pack_hash(&self) -> ObjectId {
        let start = self.map.len() - 40;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&self.map[start..start + 20]);
        ObjectId(bytes)
    }

    /// All object ids in sorted order.
    pub fn iter_oids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        (0..self.object_count).map(|i| self.oid_at(i))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use byteorder::{BigEndian, WriteBytesExt};
    use sha1::{Digest, Sha1};

    use super::*;

    /// Serialize a v2 idx covering `entries` of (oid, crc, offset), in the
    /// layout `IdxFile` reads back.
    pub(crate) fn build_idx(mut entries: Vec<(ObjectId, u32, u64)>, pack_hash: ObjectId) -> Vec<u8> {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = Vec::new();
        out.extend_from_slice(&IDX_MAGIC);
        out.write_u32::<BigEndian>(2).unwrap();

        let mut fanout = [0u32; 256];
        for (oid, _, _) in &entries {
            fanout[oid.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            out.write_u32::<BigEndian>(count).unwrap();
        }
        for (oid, _, _) in &entries {
            out.extend_from_slice(oid.as_ref());
        }
        for (_, crc, _) in &entries {
            out.write_u32::<BigEndian>(*crc).unwrap();
        }
        let mut large = Vec::new();
        for (_, _, offset) in &entries {
            if *offset <= 0x7FFF_FFFF {
                out.write_u32::<BigEndian>(*offset as u32).unwrap();
            } else {
                out.write_u32::<BigEndian>(0x8000_0000 | large.len() as u32)
                    .unwrap();
                large.push(*offset);
            }
        }
        for offset in large {
            out.write_u64::<BigEndian>(offset).unwrap();
        }
        out.extend_from_slice(pack_hash.as_ref());
        let trailer = Sha1::digest(&out);
        out.extend_from_slice(trailer.as_ref());
        out
    }

    fn write_idx(entries: Vec<(ObjectId, u32, u64)>) -> (tempfile::TempDir, IdxFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack-test.idx");
        std::fs::write(&path, build_idx(entries, ObjectId([0xAA; 20]))).unwrap();
        let idx = IdxFile::open(&path).unwrap();
        (dir, idx)
    }

    fn oid(n: u8) -> ObjectId {
        ObjectId([n; 20])
    }

    /// Lookup finds each stored oid with its offset; misses return None.
    #[test]
    fn test_lookup() {
        let (_dir, idx) = write_idx(vec![
            (oid(0x10), 111, 12),
            (oid(0x80), 222, 1040),
            (oid(0x81), 333, 2080),
        ]);
        assert_eq!(idx.object_count(), 3);
        assert_eq!(idx.offset_of(&oid(0x10)).unwrap(), Some(12));
        assert_eq!(idx.offset_of(&oid(0x80)).unwrap(), Some(1040));
        assert_eq!(idx.offset_of(&oid(0x81)).unwrap(), Some(2080));
        assert_eq!(idx.offset_of(&oid(0x99)).unwrap(), None);
        assert!(idx.contains(&oid(0x80)));
        assert!(!idx.contains(&oid(0x42)));
        assert_eq!(idx.pack_hash(), ObjectId([0xAA; 20]));
    }

    /// Offsets above 2^31 route through the large-offset table.
    #[test]
    fn test_large_offsets() {
        let big = 0x1_2345_6789u64;
        let (_dir, idx) = write_idx(vec![(oid(0x01), 1, 12), (oid(0x02), 2, big)]);
        assert_eq!(idx.offset_of(&oid(0x02)).unwrap(), Some(big));
        assert_eq!(idx.offset_of(&oid(0x01)).unwrap(), Some(12));
    }

    /// Entries come back in sorted order regardless of insertion order.
    #[test]
    fn test_sorted_iteration() {
        let (_dir, idx) = write_idx(vec![
            (oid(0x30), 0, 3),
            (oid(0x10), 0, 1),
            (oid(0x20), 0, 2),
        ]);
        let oids: Vec<_> = idx.iter_oids().collect();
        assert_eq!(oids, vec![oid(0x10), oid(0x20), oid(0x30)]);
        assert_eq!(idx.crc_at(0), 0);
    }

    /// Bad magic and truncated files are rejected up front.
    #[test]
    fn test_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.idx");
        std::fs::write(&path, b"not an idx").unwrap();
        assert!(IdxFile::open(&path).is_err());

        let mut bytes = build_idx(vec![(oid(1), 0, 12)], ObjectId::ZERO);
        bytes[0] = 0;
        std::fs::write(&path, bytes).unwrap();
        assert!(IdxFile::open(&path).is_err());
    }
}
