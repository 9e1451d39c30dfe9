//! Enlistment layout and persistent identity.
//!
//! An enlistment is the prepared directory a repo mounts into: `src/` for the
//! virtualized working tree, `.git/` for the repo, and `.gvfs/` for the
//! core's own metadata (config, databases, logs, diagnostics). A shared local
//! cache root holds the object store; `mapping.dat` keys it by enlistment
//! identity so several enlistments of the same repo share objects.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::{
    config::{parse_dat, write_dat},
    errors::GvfsError,
    util,
};

/// Highest on-disk layout this build can mount.
pub const SUPPORTED_LAYOUT_VERSION: u32 = 16;

/// Process exit codes shared with the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GenericFailure = 1,
    NullRequest = 2,
    RebaselineRequired = 3,
    FilterDriverMissing = 4,
    InvalidMountPoint = 5,
}

/// Persistent per-enlistment metadata, stored as `RepoMetadata.dat`.
#[derive(Debug)]
pub struct RepoMetadata {
    path: PathBuf,
    pairs: HashMap<String, String>,
}

impl RepoMetadata {
    const KEY_ENLISTMENT_ID: &'static str = "enlistment_id";
    const KEY_LAYOUT_VERSION: &'static str = "disk_layout_version";

    /// Load the metadata file, creating identity on first mount.
    pub fn load_or_create(path: PathBuf) -> Result<RepoMetadata, GvfsError> {
        let mut pairs = match fs::read_to_string(&path) {
            Ok(contents) => parse_dat(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let mut dirty = false;
        if !pairs.contains_key(Self::KEY_ENLISTMENT_ID) {
            pairs.insert(
                Self::KEY_ENLISTMENT_ID.to_string(),
                Uuid::new_v4().to_string(),
            );
            dirty = true;
        }
        if !pairs.contains_key(Self::KEY_LAYOUT_VERSION) {
            pairs.insert(
                Self::KEY_LAYOUT_VERSION.to_string(),
                SUPPORTED_LAYOUT_VERSION.to_string(),
            );
            dirty = true;
        }
        let metadata = RepoMetadata { path, pairs };
        if dirty {
            metadata.save()?;
        }
        metadata.check_layout()?;
        Ok(metadata)
    }

    fn check_layout(&self) -> Result<(), GvfsError> {
        let found = self.layout_version();
        if found > SUPPORTED_LAYOUT_VERSION {
            return Err(GvfsError::UnsupportedLayout {
                found,
                supported: SUPPORTED_LAYOUT_VERSION,
            });
        }
        Ok(())
    }

    pub fn enlistment_id(&self) -> &str {
        self.pairs
            .get(Self::KEY_ENLISTMENT_ID)
            .expect("identity is created on load")
    }

    pub fn layout_version(&self) -> u32 {
        self.pairs
            .get(Self::KEY_LAYOUT_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), GvfsError> {
        self.pairs.insert(key.to_string(), value.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), GvfsError> {
        util::atomic_write(&self.path, write_dat(&self.pairs).as_bytes())?;
        Ok(())
    }
}

/// Resolved paths and identity for one enlistment.
#[derive(Debug)]
pub struct Enlistment {
    root: PathBuf,
    local_cache_root: PathBuf,
    pub metadata: RepoMetadata,
    /// Refreshed on every mount; dies with the process.
    pub mount_id: Uuid,
}

impl Enlistment {
    /// Open (or initialize) the enlistment at `root`, with its shared cache
    /// under `local_cache_root`.
    pub fn open(root: PathBuf, local_cache_root: PathBuf) -> Result<Enlistment, GvfsError> {
        if !root.is_dir() {
            return Err(GvfsError::Metadata(format!(
                "enlistment root {} does not exist",
                root.display()
            )));
        }
        let dot_gvfs = root.join(".gvfs");
        for dir in ["databases", "logs", "diagnostics"] {
            fs::create_dir_all(dot_gvfs.join(dir))?;
        }
        let metadata = RepoMetadata::load_or_create(dot_gvfs.join("RepoMetadata.dat"))?;
        Ok(Enlistment {
            root,
            local_cache_root,
            metadata,
            mount_id: Uuid::new_v4(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The virtualized working tree.
    pub fn src_root(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    pub fn dot_gvfs(&self) -> PathBuf {
        self.root.join(".gvfs")
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.dot_gvfs().join("databases")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dot_gvfs().join("logs")
    }

    pub fn config_dat(&self) -> PathBuf {
        self.dot_gvfs().join("config.dat")
    }

    pub fn index_file(&self) -> PathBuf {
        self.git_dir().join("index")
    }

    pub fn local_cache_root(&self) -> &Path {
        &self.local_cache_root
    }

    /// Resolve (or assign) this enlistment's key in the shared cache via
    /// `mapping.dat`, then return the shared objects directory for that key.
    pub fn shared_objects_dir(&self) -> Result<PathBuf, GvfsError> {
        let mapping_path = self.local_cache_root.join("mapping.dat");
        let mut mapping = match fs::read_to_string(&mapping_path) {
            Ok(contents) => parse_dat(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let id = self.metadata.enlistment_id().to_ascii_lowercase();
        let key = match mapping.get(&id) {
            Some(key) => key.clone(),
            None => {
                let key = Uuid::new_v4().simple().to_string();
                mapping.insert(id, key.clone());
                fs::create_dir_all(&self.local_cache_root)?;
                util::atomic_write(&mapping_path, write_dat(&mapping).as_bytes())?;
                key
            }
        };
        let objects = self.local_cache_root.join(key).join("gitObjects");
        fs::create_dir_all(objects.join("pack"))?;
        fs::create_dir_all(objects.join("info"))?;
        Ok(objects)
    }

    /// Point the repo's `.git/objects` at the shared cache through the
    /// alternates file.
    pub fn write_alternates(&self, shared_objects: &Path) -> Result<(), GvfsError> {
        let info = self.git_dir().join("objects").join("info");
        fs::create_dir_all(&info)?;
        util::atomic_write(
            &info.join("alternates"),
            format!("{}\n", shared_objects.display()).as_bytes(),
        )?;
        Ok(())
    }
}
