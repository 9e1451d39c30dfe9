//! Git index file parser (versions 2, 3, and 4).
//!
//! Only what projection needs is retained per entry: path, object id, mode,
//! skip-worktree, and the cached stat size. Extensions (TREE, link, and the
//! rest) are skipped by their declared size; the trailing SHA-1 is verified
//! so a torn index write surfaces as corruption instead of a wrong listing.

use std::path::Path;

use bstr::BString;
use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};

use crate::{errors::GvfsError, object::EntryMode, oid::ObjectId};

const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";
const FLAG_EXTENDED: u16 = 0x4000;
const NAME_LENGTH_MASK: u16 = 0x0FFF;
const EXTENDED_FLAG_SKIP_WORKTREE: u16 = 0x4000;

/// One index entry, reduced to what projection consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Repo-relative path with forward slashes, raw bytes.
    pub path: BString,
    pub oid: ObjectId,
    pub mode: EntryMode,
    /// Set for phantom entries the working tree has not materialized.
    pub skip_worktree: bool,
    /// Cached file size from the stat data.
    pub size: u32,
}

/// Change signature of the index file; projection rebuilds when it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSignature {
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub size: u64,
    pub inode: u64,
}

impl IndexSignature {
    pub fn read(path: &Path) -> Result<IndexSignature, GvfsError> {
        let metadata = std::fs::metadata(path)?;
        let mtime = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&metadata);
        #[cfg(not(unix))]
        let inode = 0;
        Ok(IndexSignature {
            mtime_secs: mtime.as_secs() as i64,
            mtime_nanos: mtime.subsec_nanos(),
            size: metadata.len(),
            inode,
        })
    }
}

fn corrupt(path: &Path, detail: &str) -> GvfsError {
    GvfsError::InvalidIndexFile(path.display().to_string(), detail.to_string())
}

/// Parse the index at `path` into its entries.
pub fn parse_index(path: &Path) -> Result<Vec<IndexEntry>, GvfsError> {
    let data = std::fs::read(path)?;
    parse_index_bytes(&data, path)
}

pub(crate) fn parse_index_bytes(data: &[u8], path: &Path) -> Result<Vec<IndexEntry>, GvfsError> {
    if data.len() < 12 + 20 {
        return Err(corrupt(path, "too short for header and trailer"));
    }
    if &data[..4] != INDEX_SIGNATURE {
        return Err(corrupt(path, "bad signature"));
    }
    let version = BigEndian::read_u32(&data[4..8]);
    if !(2..=4).contains(&version) {
        return Err(corrupt(path, &format!("unsupported version {version}")));
    }
    let entry_count = BigEndian::read_u32(&data[8..12]) as usize;

    // The trailer hash covers everything before it.
    let body_end = data.len() - 20;
    let expected = &data[body_end..];
    let actual = Sha1::digest(&data[..body_end]);
    if actual.as_slice() != expected {
        return Err(corrupt(path, "trailer hash mismatch"));
    }

    let mut entries = Vec::with_capacity(entry_count);
    let mut pos = 12usize;
    let mut previous_path = BString::new(Vec::new());

    for _ in 0..entry_count {
        let entry_start = pos;
        if pos + 62 > body_end {
            return Err(corrupt(path, "truncated entry"));
        }
        // ctime(8) mtime(8) dev(4) ino(4) mode(4) uid(4) gid(4) size(4)
        let mode_bits = BigEndian::read_u32(&data[pos + 24..]);
        let size = BigEndian::read_u32(&data[pos + 36..]);
        pos += 40;
        let oid = ObjectId::from_bytes(&data[pos..pos + 20])?;
        pos += 20;
        let flags = BigEndian::read_u16(&data[pos..]);
        pos += 2;

        let mut skip_worktree = false;
        if flags & FLAG_EXTENDED != 0 {
            if version < 3 {
                return Err(corrupt(path, "extended flags in a v2 index"));
            }
            if pos + 2 > body_end {
                return Err(corrupt(path, "truncated extended flags"));
            }
            let extended = BigEndian::read_u16(&data[pos..]);
            skip_worktree = extended & EXTENDED_FLAG_SKIP_WORKTREE != 0;
            pos += 2;
        }

        let name_length = (flags & NAME_LENGTH_MASK) as usize;
        let entry_path = if version == 4 {
            // Prefix compression: strip N bytes off the previous path, append
            // the NUL-terminated suffix.
            let strip = read_prefix_varint(data, &mut pos, body_end)
                .ok_or_else(|| corrupt(path, "truncated path varint"))?;
            let keep = previous_path
                .len()
                .checked_sub(strip as usize)
                .ok_or_else(|| corrupt(path, "prefix strip longer than previous path"))?;
            let nul = memchr::memchr(0, &data[pos..body_end])
                .ok_or_else(|| corrupt(path, "unterminated path"))?;
            let mut full = previous_path[..keep].to_vec();
            full.extend_from_slice(&data[pos..pos + nul]);
            pos += nul + 1;
            BString::from(full)
        } else {
            let nul = memchr::memchr(0, &data[pos..body_end])
                .ok_or_else(|| corrupt(path, "unterminated path"))?;
            if name_length < NAME_LENGTH_MASK as usize && nul != name_length {
                return Err(corrupt(path, "path length disagrees with flags"));
            }
            let entry_path = BString::from(&data[pos..pos + nul]);
            pos += nul + 1;
            // Entries are padded with NULs to a multiple of 8 bytes.
            let entry_len = pos - entry_start;
            let padded = entry_len.div_ceil(8) * 8;
            pos = entry_start + padded.min(body_end - entry_start);
            entry_path
        };

        previous_path = entry_path.clone();
        entries.push(IndexEntry {
            path: entry_path,
            oid,
            mode: EntryMode::from_mode_bits(mode_bits)
                .map_err(|_| corrupt(path, "bad entry mode"))?,
            skip_worktree,
            size,
        });
    }

    // Extensions follow the entries; skip each by its declared size.
    while pos + 8 <= body_end {
        let ext_size = BigEndian::read_u32(&data[pos + 4..]) as usize;
        pos += 8;
        if pos + ext_size > body_end {
            return Err(corrupt(path, "extension overruns trailer"));
        }
        pos += ext_size;
    }
    if pos != body_end {
        return Err(corrupt(path, "trailing garbage after extensions"));
    }

    Ok(entries)
}

/// The index v4 "offset" varint: 7 bits per byte, MSB continues, each
/// continuation adds one to the accumulated high bits.
fn read_prefix_varint(data: &[u8], pos: &mut usize, end: usize) -> Option<u64> {
    let mut byte = *data.get(*pos).filter(|_| *pos < end)?;
    *pos += 1;
    let mut value = (byte & 0x7F) as u64;
    while byte & 0x80 != 0 {
        byte = *data.get(*pos).filter(|_| *pos < end)?;
        *pos += 1;
        value = ((value + 1) << 7) | (byte & 0x7F) as u64;
    }
    Some(value)
}
