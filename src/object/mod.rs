//! Git object model and the two-tier object store (loose + packed) backing
//! hydration.
//!
//! Layout follows the on-disk formats Git itself writes: zlib loose objects
//! under `xx/yyy…`, `pack-*.pack` with v2 `.idx` companions, and an optional
//! multi-pack-index covering them.

pub mod idx;
pub mod loose;
pub mod midx;
pub mod pack;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::errors::GvfsError;

/// In Git, each object type is assigned a unique integer value used to
/// identify it inside pack entry headers (3 type bits, values 1..=7).
///
/// * `Commit` (1), `Tree` (2), `Blob` (3), `Tag` (4) are base objects.
/// * `OfsDelta` (6) stores a delta whose base is found at a relative pack
///   offset; `RefDelta` (7) names its base by object id.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
    OfsDelta = 6,
    RefDelta = 7,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectKind::Commit => write!(f, "commit"),
            ObjectKind::Tree => write!(f, "tree"),
            ObjectKind::Blob => write!(f, "blob"),
            ObjectKind::Tag => write!(f, "tag"),
            ObjectKind::OfsDelta => write!(f, "ofs-delta"),
            ObjectKind::RefDelta => write!(f, "ref-delta"),
        }
    }
}

impl ObjectKind {
    /// The ASCII name written into loose object headers. Delta kinds never
    /// appear there.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ObjectKind::Commit => b"commit",
            ObjectKind::Tree => b"tree",
            ObjectKind::Blob => b"blob",
            ObjectKind::Tag => b"tag",
            ObjectKind::OfsDelta | ObjectKind::RefDelta => {
                unreachable!("delta kinds have no loose header form")
            }
        }
    }

    /// Parses the name from a loose object header or `git cat-file -t`.
    pub fn from_str(s: &str) -> Result<ObjectKind, GvfsError> {
        match s {
            "commit" => Ok(ObjectKind::Commit),
            "tree" => Ok(ObjectKind::Tree),
            "blob" => Ok(ObjectKind::Blob),
            "tag" => Ok(ObjectKind::Tag),
            _ => Err(GvfsError::InvalidObjectType(s.to_string())),
        }
    }

    /// Decode the 3-bit pack header type id.
    pub fn from_pack_type(number: u8) -> Result<ObjectKind, GvfsError> {
        match number {
            1 => Ok(ObjectKind::Commit),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Blob),
            4 => Ok(ObjectKind::Tag),
            6 => Ok(ObjectKind::OfsDelta),
            7 => Ok(ObjectKind::RefDelta),
            _ => Err(GvfsError::InvalidObjectType(format!(
                "invalid pack object type number: {number}"
            ))),
        }
    }

    /// True for objects that carry their own content (not deltas).
    pub fn is_base(&self) -> bool {
        !matches!(self, ObjectKind::OfsDelta | ObjectKind::RefDelta)
    }
}

/// The file mode recorded for a tree entry, as projected into the working
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryMode {
    Regular,
    Executable,
    Symlink,
    Submodule,
    Subtree,
}

impl EntryMode {
    /// Map the octal mode bits stored in trees and the index.
    pub fn from_mode_bits(bits: u32) -> Result<EntryMode, GvfsError> {
        match bits & 0o170000 {
            0o100000 => {
                if bits & 0o111 != 0 {
                    Ok(EntryMode::Executable)
                } else {
                    Ok(EntryMode::Regular)
                }
            }
            0o120000 => Ok(EntryMode::Symlink),
            0o160000 => Ok(EntryMode::Submodule),
            0o040000 => Ok(EntryMode::Subtree),
            _ => Err(GvfsError::InvalidObjectType(format!(
                "unrecognized entry mode bits {bits:o}"
            ))),
        }
    }

    /// True when the entry projects as a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self, EntryMode::Subtree)
    }
}
