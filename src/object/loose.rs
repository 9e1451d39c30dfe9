//! Loose object tier: one zlib-deflated file per object under a two-hex-char
//! fanout directory.

use std::{fs, io, path::PathBuf};

use tracing::debug;

use crate::{errors::GvfsError, object::ObjectKind, oid::ObjectId, util, zlib};

/// Reader/writer for a single `objects/` directory of loose files.
pub struct LooseStore {
    root: PathBuf,
}

impl LooseStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn object_path(&self, oid: &ObjectId) -> PathBuf {
        let (dir, name) = oid.loose_path();
        self.root.join(dir).join(name)
    }

    /// O(1) existence probe via the filesystem.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.object_path(oid).exists()
    }

    /// Read and inflate a loose object, verifying its id against the content.
    pub fn read(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
        let path = self.object_path(oid);
        let compressed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GvfsError::ObjectNotFound(oid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let (kind, data) = zlib::inflate_loose(&compressed)
            .map_err(|_| GvfsError::CorruptObject(oid.to_string(), "bad zlib stream".into()))?;
        let actual = ObjectId::for_object(kind, &data);
        if actual != *oid {
            return Err(GvfsError::CorruptObject(
                oid.to_string(),
                format!("content hashed to {actual}"),
            ));
        }
        Ok((kind, data))
    }

    /// Read the raw deflated bytes without inflating. This is the wire form
    /// the loose-object endpoint serves, so hydration can persist it as-is.
    pub fn read_compressed(&self, oid: &ObjectId) -> Result<Vec<u8>, GvfsError> {
        match fs::read(self.object_path(oid)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(GvfsError::ObjectNotFound(oid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist an object: deflate, write to `tmp_obj_<rand>`, fsync, rename
    /// into the fanout directory. An already-present destination wins; the
    /// bytes are identical by construction.
    pub fn write(&self, oid: &ObjectId, kind: ObjectKind, data: &[u8]) -> Result<(), GvfsError> {
        let actual = ObjectId::for_object(kind, data);
        if actual != *oid {
            return Err(GvfsError::CorruptObject(
                oid.to_string(),
                format!("refusing to store bytes hashing to {actual}"),
            ));
        }
        let compressed = zlib::deflate_loose(kind, data)?;
        self.write_compressed_unchecked(oid, &compressed)
    }

    /// Persist pre-deflated bytes fetched from the object service. The caller
    /// is expected to have inflated and verified them first.
    pub fn write_compressed_unchecked(
        &self,
        oid: &ObjectId,
        compressed: &[u8],
    ) -> Result<(), GvfsError> {
        let dest = self.object_path(oid);
        util::atomic_write_new(&dest, compressed)?;
        debug!(oid = %oid, bytes = compressed.len(), "stored loose object");
        Ok(())
    }

    /// Enumerate every loose object id in the store. Maintenance uses this to
    /// decide when packing is worthwhile.
    pub fn iter_oids(&self) -> Result<Vec<ObjectId>, GvfsError> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let dir_name = entry.file_name();
            let Some(prefix) = dir_name.to_str() else {
                continue;
            };
            if prefix.len() != 2 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let name = file.file_name();
                let Some(rest) = name.to_str() else { continue };
                if let Ok(oid) = format!("{prefix}{rest}").parse::<ObjectId>() {
                    out.push(oid);
                }
            }
        }
        Ok(out)
    }

    /// Remove a loose object after it has been packed.
    pub fn remove(&self, oid: &ObjectId) -> Result<(), GvfsError> {
        match fs::remove_file(self.object_path(oid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
