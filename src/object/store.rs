//! Two-tier object store facade.
//!
//! Reads consult the loose tier first (O(1) existence), then packs through the
//! multi-pack-index when one exists, then per-pack idx files, then any
//! alternate object roots listed in `info/alternates`. Writes always land in
//! the primary root: loose objects atomically, packs via `git index-pack`
//! with a `.keep` marker claiming ownership for maintenance.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::{
    errors::GvfsError,
    gitproc::GitCommand,
    object::{
        ObjectKind,
        idx::IdxFile,
        loose::LooseStore,
        midx::MidxFile,
        pack::{BaseResolver, PackFile},
    },
    oid::ObjectId,
};

/// An idx/pack pair that is open for reading.
struct PackHandle {
    idx: IdxFile,
    pack: PackFile,
}

/// The packed tier of one object root, rebuilt after maintenance.
#[derive(Default)]
struct PackSet {
    midx: Option<MidxFile>,
    handles: Vec<PackHandle>,
    by_idx_name: HashMap<String, usize>,
}

impl PackSet {
    fn load(pack_dir: &Path) -> PackSet {
        let mut set = PackSet::default();
        let midx_path = pack_dir.join("multi-pack-index");
        if midx_path.exists() {
            match MidxFile::open(&midx_path) {
                Ok(midx) => set.midx = Some(midx),
                Err(e) => warn!(path = %midx_path.display(), error = %e, "ignoring unreadable multi-pack-index"),
            }
        }
        let entries = match fs::read_dir(pack_dir) {
            Ok(entries) => entries,
            Err(_) => return set,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("pack-") || !name.ends_with(".idx") {
                continue;
            }
            let pack_path = path.with_extension("pack");
            if !pack_path.exists() {
                continue;
            }
            match (IdxFile::open(&path), PackFile::open(&pack_path)) {
                (Ok(idx), Ok(pack)) => {
                    set.by_idx_name.insert(name.to_string(), set.handles.len());
                    set.handles.push(PackHandle { idx, pack });
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable pack");
                }
            }
        }
        set
    }

    fn contains(&self, oid: &ObjectId) -> bool {
        if let Some(midx) = &self.midx
            && midx.contains(oid)
        {
            return true;
        }
        self.handles.iter().any(|h| h.idx.contains(oid))
    }
}

/// One objects directory: loose fanout dirs plus a `pack/` subdirectory.
struct StoreRoot {
    loose: LooseStore,
    pack_dir: PathBuf,
    packs: RwLock<Arc<PackSet>>,
}

impl StoreRoot {
    fn open(objects_dir: PathBuf) -> StoreRoot {
        let pack_dir = objects_dir.join("pack");
        StoreRoot {
            loose: LooseStore::new(objects_dir),
            packs: RwLock::new(Arc::new(PackSet::load(&pack_dir))),
            pack_dir,
        }
    }

    fn pack_set(&self) -> Arc<PackSet> {
        self.packs.read().expect("pack set lock poisoned").clone()
    }

    fn read_packed(
        &self,
        oid: &ObjectId,
        resolver: &dyn BaseResolver,
    ) -> Result<Option<(ObjectKind, Vec<u8>)>, GvfsError> {
        // Take the snapshot and release the lock: delta resolution may
        // re-enter the store for a base in another pack or the loose tier.
        let packs = self.pack_set();
        if let Some(midx) = &packs.midx
            && let Some(entry) = midx.lookup(oid)?
        {
            let idx_name = midx
                .pack_names()
                .get(entry.pack_id as usize)
                .ok_or_else(|| {
                    GvfsError::InvalidPackIndex(midx.path().display().to_string())
                })?;
            if let Some(&i) = packs.by_idx_name.get(idx_name) {
                return Ok(Some(packs.handles[i].pack.read_at(entry.offset, resolver)?));
            }
        }
        for handle in &packs.handles {
            if let Some(offset) = handle.idx.offset_of(oid)? {
                return Ok(Some(handle.pack.read_at(offset, resolver)?));
            }
        }
        Ok(None)
    }
}

/// The object store shared by hydration and maintenance.
pub struct ObjectStore {
    primary: StoreRoot,
    alternates: Vec<StoreRoot>,
    git_binary: PathBuf,
}

impl ObjectStore {
    /// Open the store rooted at `objects_dir`, following its alternates file
    /// one level deep (Git itself chains further; the cache layout never
    /// does).
    pub fn open(objects_dir: PathBuf, git_binary: PathBuf) -> Result<ObjectStore, GvfsError> {
        let alternates_file = objects_dir.join("info").join("alternates");
        let mut alternates = Vec::new();
        match fs::read_to_string(&alternates_file) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    alternates.push(StoreRoot::open(PathBuf::from(line)));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(ObjectStore {
            primary: StoreRoot::open(objects_dir),
            alternates,
            git_binary,
        })
    }

    fn roots(&self) -> impl Iterator<Item = &StoreRoot> {
        std::iter::once(&self.primary).chain(self.alternates.iter())
    }

    /// O(1) on the loose tier, O(log n) on the packed tier.
    pub fn has_object(&self, oid: &ObjectId) -> bool {
        self.roots()
            .any(|root| root.loose.contains(oid) || root.pack_set().contains(oid))
    }

    /// Read and fully resolve an object from whichever tier holds it.
    pub fn read_object(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
        for root in self.roots() {
            match root.loose.read(oid) {
                Ok(found) => return Ok(found),
                Err(GvfsError::ObjectNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if let Some(found) = root.read_packed(oid, self)? {
                return Ok(found);
            }
        }
        Err(GvfsError::ObjectNotFound(oid.to_string()))
    }

    /// Size of an object's content without retaining the bytes.
    pub fn object_size(&self, oid: &ObjectId) -> Result<u64, GvfsError> {
        let (_, data) = self.read_object(oid)?;
        Ok(data.len() as u64)
    }

    /// Store one loose object in the primary root.
    pub fn write_loose(
        &self,
        oid: &ObjectId,
        kind: ObjectKind,
        data: &[u8],
    ) -> Result<(), GvfsError> {
        self.primary.loose.write(oid, kind, data)
    }

    /// Store the raw deflated wire form served by the loose endpoint.
    pub fn write_loose_compressed(
        &self,
        oid: &ObjectId,
        compressed: &[u8],
    ) -> Result<(), GvfsError> {
        self.primary.loose.write_compressed_unchecked(oid, compressed)
    }

    /// The primary loose tier, for maintenance enumeration.
    pub fn loose(&self) -> &LooseStore {
        &self.primary.loose
    }

    pub fn pack_dir(&self) -> &Path {
        &self.primary.pack_dir
    }

    /// Paths of every idx currently readable in the primary root.
    pub fn iter_pack_indexes(&self) -> Vec<PathBuf> {
        self.primary
            .pack_set()
            .handles
            .iter()
            .map(|h| h.idx.path().to_path_buf())
            .collect()
    }

    /// Re-scan the pack directory after maintenance rewrote it.
    pub fn refresh_packs(&self) {
        let fresh = Arc::new(PackSet::load(&self.primary.pack_dir));
        *self.primary.packs.write().expect("pack set lock poisoned") = fresh;
        for root in &self.alternates {
            *root.packs.write().expect("pack set lock poisoned") =
                Arc::new(PackSet::load(&root.pack_dir));
        }
    }

    /// Persist a pack stream fetched from the object service: write it to a
    /// temp name, index it with `git index-pack`, install it under its
    /// trailer-hash name with a `.keep` marker, and return the object ids it
    /// contains.
    pub async fn write_pack(&self, pack_bytes: &[u8]) -> Result<Vec<ObjectId>, GvfsError> {
        if pack_bytes.len() < 32 {
            return Err(GvfsError::InvalidPackFile("<stream>".into()));
        }
        fs::create_dir_all(&self.primary.pack_dir)?;
        let token = rand::rng().next_u64();
        let tmp_pack = self.primary.pack_dir.join(format!("tmp_pack_{token:016x}.pack"));
        fs::write(&tmp_pack, pack_bytes)?;

        let indexed = GitCommand::new(&self.git_binary, "index incoming pack")
            .arg("index-pack")
            .arg(&tmp_pack)
            .output()
            .await;
        if let Err(e) = indexed {
            let _ = fs::remove_file(&tmp_pack);
            return Err(e);
        }
        let tmp_idx = tmp_pack.with_extension("idx");

        // The trailer hash names the installed pack.
        let mut trailer = [0u8; 20];
        trailer.copy_from_slice(&pack_bytes[pack_bytes.len() - 20..]);
        let hash = ObjectId(trailer);
        let final_pack = self.primary.pack_dir.join(format!("pack-{hash}.pack"));
        let final_idx = final_pack.with_extension("idx");
        let final_keep = final_pack.with_extension("keep");

        if final_pack.exists() {
            // Another hydration already installed this pack.
            let _ = fs::remove_file(&tmp_pack);
            let _ = fs::remove_file(&tmp_idx);
        } else {
            fs::rename(&tmp_pack, &final_pack)?;
            fs::rename(&tmp_idx, &final_idx)?;
            fs::write(&final_keep, b"gvfs\n")?;
        }

        let idx = IdxFile::open(&final_idx)?;
        if let Err(e) = verify_pack_crcs(&idx, pack_bytes) {
            drop(idx);
            let _ = fs::remove_file(&final_pack);
            let _ = fs::remove_file(&final_idx);
            let _ = fs::remove_file(&final_keep);
            return Err(e);
        }
        let oids: Vec<ObjectId> = idx.iter_oids().collect();
        info!(pack = %final_pack.display(), objects = oids.len(), "installed pack");
        self.refresh_packs();
        Ok(oids)
    }

    /// Delete idx files whose pack is gone. Multi-pack-index expire cannot
    /// unlink an idx held open elsewhere; this sweep finishes the job on the
    /// next maintenance run. Returns the file names it removed.
    pub fn clean_stale_idx_files(&self) -> Result<Vec<String>, GvfsError> {
        let mut removed = Vec::new();
        let entries = match fs::read_dir(&self.primary.pack_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".idx") {
                continue;
            }
            if !path.with_extension("pack").exists() {
                debug!(file = name, "removing stale idx");
                fs::remove_file(&path)?;
                removed.push(name.to_string());
            }
        }
        if !removed.is_empty() {
            self.refresh_packs();
        }
        Ok(removed)
    }

    /// True when at least one pack in the primary root carries our `.keep`
    /// marker; maintenance skips repacking stores it does not own.
    pub fn owns_packs(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.primary.pack_dir) else {
            return false;
        };
        entries.flatten().any(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "keep")
        })
    }
}

impl BaseResolver for ObjectStore {
    fn resolve_base(&self, oid: &ObjectId) -> Result<(ObjectKind, Vec<u8>), GvfsError> {
        self.read_object(oid)
    }
}

/// CRC-check every entry of a freshly indexed pack against the bytes that
/// came off the wire. Entry spans are the gaps between sorted offsets; the
/// CRC column covers an entry's raw bytes, header included.
pub fn verify_pack_crcs(idx: &IdxFile, pack_bytes: &[u8]) -> Result<(), GvfsError> {
    if pack_bytes.len() < 32 {
        return Err(GvfsError::InvalidPackFile("<stream>".into()));
    }
    let data_end = pack_bytes.len() - 20;
    let mut spans: Vec<(u64, usize)> = Vec::with_capacity(idx.object_count());
    for i in 0..idx.object_count() {
        spans.push((idx.offset_at(i)?, i));
    }
    spans.sort_unstable();
    for (k, (offset, i)) in spans.iter().enumerate() {
        let start = *offset as usize;
        let end = spans
            .get(k + 1)
            .map(|(next, _)| *next as usize)
            .unwrap_or(data_end);
        if start >= end || end > data_end {
            return Err(GvfsError::InvalidPackFile(format!(
                "entry span {start}..{end} outside pack data"
            )));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&pack_bytes[start..end]);
        let actual = hasher.finalize();
        let expected = idx.crc_at(*i);
        if actual != expected {
            return Err(GvfsError::CorruptObject(
                idx.oid_at(*i).to_string(),
                format!("pack entry CRC {actual:08x} != index CRC {expected:08x}"),
            ));
        }
    }
    Ok(())
}
