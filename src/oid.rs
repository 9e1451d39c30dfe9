//! SHA-1 object identifiers.
//!
//! Every Git object the core touches is addressed by a 40-hex SHA-1. Equality
//! and ordering are byte-wise on the 20-byte binary form, which is what the
//! pack index fanout and binary search rely on.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{errors::GvfsError, object::ObjectKind};

/// A 20-byte SHA-1 object id.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct ObjectId(pub [u8; 20]);

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parse a 40-hex string into an `ObjectId`.
impl FromStr for ObjectId {
    type Err = GvfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(GvfsError::InvalidObjectId(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| GvfsError::InvalidObjectId(s.to_string()))?;
        let mut h = [0u8; 20];
        h.copy_from_slice(&bytes);
        Ok(ObjectId(h))
    }
}

impl ObjectId {
    /// The all-zero id, used as a sentinel in wire formats.
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    /// Byte length of the binary form.
    pub const SIZE: usize = 20;

    /// Hash raw data into an id (no object header).
    pub fn digest(data: &[u8]) -> ObjectId {
        let h = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(h.as_ref());
        ObjectId(bytes)
    }

    /// Compute the id of a Git object: SHA-1 over `"<kind> <len>\0<data>"`.
    pub fn for_object(kind: ObjectKind, data: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(b"\x00");
        hasher.update(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(hasher.finalize().as_ref());
        ObjectId(bytes)
    }

    /// Create an `ObjectId` from exactly 20 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectId, GvfsError> {
        if bytes.len() != Self::SIZE {
            return Err(GvfsError::InvalidObjectId(hex::encode(bytes)));
        }
        let mut h = [0u8; 20];
        h.copy_from_slice(bytes);
        Ok(ObjectId(h))
    }

    /// Read 20 binary bytes from a stream.
    pub fn read_from(data: &mut impl io::Read) -> io::Result<ObjectId> {
        let mut h = [0u8; 20];
        data.read_exact(&mut h)?;
        Ok(ObjectId(h))
    }

    /// First byte of the binary form; index into pack fanout tables.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// The loose-store path fragment: `xx/yyyy…` (2-hex dir, 38-hex name).
    pub fn loose_path(&self) -> (String, String) {
        let hex = hex::encode(self.0);
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_digest() {
        let id = ObjectId::digest("Hello, world!".as_bytes());
        assert_eq!(id.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    /// The object-header form must match `git hash-object` for a blob.
    #[test]
    fn test_for_object_blob() {
        // echo -n "what is up, doc?" | git hash-object --stdin
        let id = ObjectId::for_object(ObjectKind::Blob, b"what is up, doc?");
        assert_eq!(id.to_string(), "bd9dbf5aae1a3862dd1526723246b20206e5fc37");
    }

    /// Hex round-trip through FromStr and Display.
    #[test]
    fn test_hex_round_trip() {
        let hex = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        let id = ObjectId::from_str(hex).unwrap();
        assert_eq!(id.to_string(), hex);
        assert_eq!(id.first_byte(), 0x8a);
    }

    /// Wrong lengths and non-hex input are rejected, not truncated.
    #[test]
    fn test_invalid_input() {
        assert!(ObjectId::from_str("8ab686").is_err());
        assert!(ObjectId::from_str(&"z".repeat(40)).is_err());
        assert!(ObjectId::from_bytes(&[0u8; 19]).is_err());
    }

    /// Reading from a stream consumes exactly 20 bytes.
    #[test]
    fn test_read_from_stream() {
        let source = [0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b,
            0x0f, 0x24, 0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d, 0xff];
        let mut reader = std::io::Cursor::new(source);
        let id = ObjectId::read_from(&mut reader).unwrap();
        assert_eq!(id.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
        assert_eq!(reader.position(), 20);
    }

    /// Loose path splits 2 + 38 hex chars.
    #[test]
    fn test_loose_path() {
        let id = ObjectId::from_str("8ab686eafeb1f44702738c8b0f24f2567c36da6d").unwrap();
        let (dir, name) = id.loose_path();
        assert_eq!(dir, "8a");
        assert_eq!(name, "b686eafeb1f44702738c8b0f24f2567c36da6d");
    }

    /// Ordering is byte-wise on the binary form.
    #[test]
    fn test_ordering() {
        let a = ObjectId([0u8; 20]);
        let mut high = [0u8; 20];
        high[0] = 1;
        let b = ObjectId(high);
        assert!(a < b);
        assert_eq!(a, ObjectId::ZERO);
    }
}
