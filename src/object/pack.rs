//! Pack data (.pack) reader.
//!
//! Entries are located by offset (from an idx or the multi-pack-index), their
//! varint headers decoded, and OFS_DELTA / REF_DELTA chains resolved to a base
//! before the delta instructions are applied. The file is memory-mapped; the
//! zlib payload inflates through the same streaming reader the loose tier
//! uses.

use std::{
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

use crate::{errors::GvfsError, object::ObjectKind, oid::ObjectId, zlib::InflateReader};

const PACK_MAGIC: &[u8; 4] = b"PACK";

/// Resolves REF_DELTA bases that live outside this pack (loose tier or a
/// sibling pack).
pub trait BaseResolver {
    fn resolve_base(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), GvfsError>;
}

/// A resolver for packs known to be self-contained. Cross-pack bases fail.
pub struct NoExternalBases;

impl BaseResolver for NoExternalBases {
    fn resolve_base(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
        Err(GvfsError::ObjectNotFound(oid.to_string()))
    }
}

/// A memory-mapped pack file.
pub struct PackFile {
    path: PathBuf,
    map: Mmap,
    object_count: u32,
}

impl PackFile {
    pub fn open(path: &Path) -> Result<PackFile, GvfsError> {
        let file = std::fs::File::open(path)?;
        // Safety: read-only map over an immutable installed pack.
        let map = unsafe { Mmap::map(&file)? };
        let display = path.display().to_string();
        if map.len() < 12 + 20 || &map[..4] != PACK_MAGIC {
            return Err(GvfsError::InvalidPackFile(display));
        }
        let version = BigEndian::read_u32(&map[4..8]);
        if version != 2 {
            return Err(GvfsError::InvalidPackFile(display));
        }
        let object_count = BigEndian::read_u32(&map[8..12]);
        Ok(PackFile {
            path: path.to_path_buf(),
            map,
            object_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object_count(&self) -> u32 {
        self.object_count
    }

    /// Trailer hash over everything before it.
    pub fn pack_hash(&self) -> ObjectId {
        let start = self.map.len() - 20;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&self.map[start..]);
        ObjectId(bytes)
    }

    /// Read and fully resolve the object at `offset`, following delta chains.
    pub fn read_at(
        &self,
        offset: u64,
        resolver: &dyn BaseResolver,
    ) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
        self.read_at_depth(offset, resolver, 0)
    }

    fn read_at_depth(
        &self,
        offset: u64,
        resolver: &dyn BaseResolver,
        depth: u32,
    ) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
        // Git caps delta chains well below this; a longer chain means a
        // corrupt or adversarial pack.
        if depth > 128 {
            return Err(GvfsError::InvalidPackFile(format!(
                "{}: delta chain exceeds 128",
                self.path.display()
            )));
        }
        let mut pos = offset as usize;
        if pos >= self.map.len().saturating_sub(20) {
            return Err(self.corrupt("entry offset out of range"));
        }

        let (kind, size) = self.read_entry_header(&mut pos)?;
        match kind {
            ObjectKind::OfsDelta => {
                let distance = self.read_ofs_distance(&mut pos)?;
                let base_offset = offset
                    .checked_sub(distance)
                    .ok_or_else(|| self.corrupt("ofs-delta points before pack start"))?;
                let delta = self.inflate_at(pos, size)?;
                let (base_kind, base) = self.read_at_depth(base_offset, resolver, depth + 1)?;
                Ok((base_kind, apply_delta(&base, &delta)?))
            }
            ObjectKind::RefDelta => {
                if pos + 20 > self.map.len() {
                    return Err(self.corrupt("truncated ref-delta base id"));
                }
                let base_oid = ObjectId::from_bytes(&self.map[pos..pos + 20])?;
                pos += 20;
                let delta = self.inflate_at(pos, size)?;
                let (base_kind, base) = resolver.resolve_base(&base_oid)?;
                Ok((base_kind, apply_delta(&base, &delta)?))
            }
            base => {
                let data = self.inflate_at(pos, size)?;
                Ok((base, data))
            }
        }
    }

    /// Decode the entry header at `pos`: 3 type bits and a little-endian
    /// 7-bit-group size varint.
    fn read_entry_header(&self, pos: &mut usize) -> Result<(ObjectKind, usize), GvfsError> {
        let mut byte = self.next_byte(pos)?;
        let kind = ObjectKind::from_pack_type((byte >> 4) & 0x07)?;
        let mut size = (byte & 0x0F) as u64;
        let mut shift = 4;
        while byte & 0x80 != 0 {
            byte = self.next_byte(pos)?;
            size |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
        }
        Ok((kind, size as usize))
    }

    /// Decode the big-endian-ish offset encoding of OFS_DELTA distances.
    fn read_ofs_distance(&self, pos: &mut usize) -> Result<u64, GvfsError> {
        let mut byte = self.next_byte(pos)?;
        let mut distance = (byte & 0x7F) as u64;
        while byte & 0x80 != 0 {
            byte = self.next_byte(pos)?;
            distance = ((distance + 1) << 7) | (byte & 0x7F) as u64;
        }
        Ok(distance)
    }

    fn next_byte(&self, pos: &mut usize) -> Result<u8, GvfsError> {
        let byte = *self
            .map
            .get(*pos)
            .ok_or_else(|| self.corrupt("truncated entry header"))?;
        *pos += 1;
        Ok(byte)
    }

    /// Inflate the zlib payload starting at `pos`, expecting `expected` bytes.
    fn inflate_at(&self, pos: usize, expected: usize) -> Result<Vec<u8>, GvfsError> {
        let end = self.map.len() - 20;
        if pos >= end {
            return Err(self.corrupt("entry payload starts past the trailer"));
        }
        let reader = BufReader::new(&self.map[pos..end]);
        let mut inflater = InflateReader::new_raw(reader);
        let mut out = Vec::with_capacity(expected);
        inflater
            .read_to_end(&mut out)
            .map_err(|_| self.corrupt("corrupt zlib payload"))?;
        if out.len() != expected {
            return Err(self.corrupt("inflated size does not match entry header"));
        }
        Ok(out)
    }

    fn corrupt(&self, detail: &str) -> GvfsError {
        GvfsError::InvalidPackFile(format!("{}: {detail}", self.path.display()))
    }
}

/// Apply Git delta instructions to `base`, producing the target buffer.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, GvfsError> {
    let mut pos = 0usize;
    let base_size = read_size_varint(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(GvfsError::InvalidPackFile(format!(
            "delta base size {base_size} does not match base length {}",
            base.len()
        )));
    }
    let result_size = read_size_varint(delta, &mut pos)?;
    let mut out = Vec::with_capacity(result_size as usize);

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        if op & 0x80 != 0 {
            // Copy from base: bits 0-3 select offset bytes, bits 4-6 size bytes.
            let mut offset = 0u64;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    let byte = *delta
                        .get(pos)
                        .ok_or_else(|| delta_corrupt("truncated copy offset"))?;
                    offset |= (byte as u64) << (8 * i);
                    pos += 1;
                }
            }
            let mut size = 0u64;
            for i in 0..3 {
                if op & (1 << (4 + i)) != 0 {
                    let byte = *delta
                        .get(pos)
                        .ok_or_else(|| delta_corrupt("truncated copy size"))?;
                    size |= (byte as u64) << (8 * i);
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let start = offset as usize;
            let end = start
                .checked_add(size as usize)
                .filter(|&e| e <= base.len())
                .ok_or_else(|| delta_corrupt("copy range outside base"))?;
            out.extend_from_slice(&base[start..end]);
        } else if op != 0 {
            // Insert literal bytes.
            let end = pos
                .checked_add(op as usize)
                .filter(|&e| e <= delta.len())
                .ok_or_else(|| delta_corrupt("truncated insert"))?;
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(delta_corrupt("reserved zero instruction"));
        }
    }

    if out.len() as u64 != result_size {
        return Err(delta_corrupt("result size mismatch"));
    }
    Ok(out)
}

fn delta_corrupt(detail: &str) -> GvfsError {
    GvfsError::InvalidPackFile(format!("delta: {detail}"))
}

fn read_size_varint(data: &[u8], pos: &mut usize) -> Result<u64, GvfsError> {
    let mut size = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| delta_corrupt("truncated size varint"))?;
        *pos += 1;
        size |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}
