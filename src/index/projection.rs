//! Directory projection over the parsed index.
//!
//! The projector owns the most recent [`ProjectedTree`] snapshot. Readers
//! load the snapshot pointer once and keep it for the whole callback, so a
//! concurrent rebuild is never partially visible: they see the old tree or
//! the new one, nothing in between. Rebuilds are gated on the index file's
//! change signature or an explicit invalidation from the pipe router.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use tracing::{debug, info};

use crate::{
    errors::GvfsError,
    index::format::{IndexSignature, parse_index},
    journal::ModifiedPathsJournal,
    object::EntryMode,
    oid::ObjectId,
};

/// One child of a projected directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEntry {
    pub name: String,
    pub oid: ObjectId,
    pub mode: EntryMode,
    /// Phantom entry: present in the index with skip-worktree set, not yet
    /// materialized on disk.
    pub skip_worktree: bool,
    /// Size cached in the index stat data (0 for phantom directories).
    pub size: u32,
}

/// A listing row after the journal merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub mode: EntryMode,
    pub oid: ObjectId,
    /// On-disk size for modified entries, index size otherwise.
    pub size: u64,
    /// The row was re-stat'd from disk because the journal owns this path.
    pub from_disk: bool,
}

/// Immutable directory-listing snapshot keyed by parent path ("" is the
/// working-tree root). Children are sorted by name.
#[derive(Debug, Default)]
pub struct ProjectedTree {
    directories: HashMap<String, Vec<ProjectedEntry>>,
}

impl ProjectedTree {
    /// Build the trie from flat index entries, synthesizing intermediate
    /// directories.
    pub fn build(entries: &[crate::index::format::IndexEntry]) -> ProjectedTree {
        let mut directories: HashMap<String, Vec<ProjectedEntry>> = HashMap::new();
        directories.entry(String::new()).or_default();

        for entry in entries {
            let path = String::from_utf8_lossy(&entry.path).into_owned();
            let mut parent = "";
            let mut walked = 0usize;
            for (i, byte) in path.bytes().enumerate() {
                if byte != b'/' {
                    continue;
                }
                let dir_path = &path[..i];
                let name = &path[walked..i];
                let children = directories.entry(parent.to_string()).or_default();
                if !children.iter().any(|c| c.name == name) {
                    children.push(ProjectedEntry {
                        name: name.to_string(),
                        oid: ObjectId::ZERO,
                        mode: EntryMode::Subtree,
                        skip_worktree: entry.skip_worktree,
                        size: 0,
                    });
                }
                directories.entry(dir_path.to_string()).or_default();
                parent = dir_path;
                walked = i + 1;
            }
            let name = &path[walked..];
            if name.is_empty() {
                continue;
            }
            directories
                .entry(parent.to_string())
                .or_default()
                .push(ProjectedEntry {
                    name: name.to_string(),
                    oid: entry.oid,
                    mode: entry.mode,
                    skip_worktree: entry.skip_worktree,
                    size: entry.size,
                });
        }

        for children in directories.values_mut() {
            children.sort_by(|a, b| a.name.cmp(&b.name));
            children.dedup_by(|a, b| a.name == b.name);
        }
        ProjectedTree { directories }
    }

    /// Raw projected children of `dir`, journal not applied.
    pub fn children_of(&self, dir: &str) -> Option<&[ProjectedEntry]> {
        self.directories.get(dir).map(Vec::as_slice)
    }

    /// Single-entry lookup by full path.
    pub fn entry_for(&self, path: &str) -> Option<&ProjectedEntry> {
        let (parent, name) = match path.rfind('/') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("", path),
        };
        let children = self.directories.get(parent)?;
        let i = children.binary_search_by(|c| c.name.as_str().cmp(name)).ok()?;
        Some(&children[i])
    }

    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }
}

/// Owner of the published snapshot.
pub struct Projector {
    index_path: std::path::PathBuf,
    snapshot: RwLock<Arc<ProjectedTree>>,
    /// Signature of the index the snapshot was built from; writers serialize
    /// here so only one rebuild runs at a time.
    rebuild: Mutex<Option<IndexSignature>>,
}

impl Projector {
    /// Parse the index and publish the first snapshot.
    pub fn load(index_path: std::path::PathBuf) -> Result<Projector, GvfsError> {
        let entries = parse_index(&index_path)?;
        let signature = IndexSignature::read(&index_path)?;
        let tree = ProjectedTree::build(&entries);
        info!(
            entries = entries.len(),
            directories = tree.directory_count(),
            "projection built"
        );
        Ok(Projector {
            index_path,
            snapshot: RwLock::new(Arc::new(tree)),
            rebuild: Mutex::new(Some(signature)),
        })
    }

    /// The current snapshot. Non-blocking apart from the pointer read; hot
    /// path for every callback.
    pub fn snapshot(&self) -> Arc<ProjectedTree> {
        self.snapshot
            .read()
            .expect("projection snapshot lock poisoned")
            .clone()
    }

    /// Rebuild when forced (index-changed notification) or when the index
    /// file's signature moved. Returns whether a new snapshot was published.
    pub fn refresh(&self, force: bool) -> Result<bool, GvfsError> {
        let mut guard = self.rebuild.lock().expect("projection rebuild lock poisoned");
        let signature = IndexSignature::read(&self.index_path)?;
        if !force && *guard == Some(signature) {
            return Ok(false);
        }
        let entries = parse_index(&self.index_path)?;
        let tree = Arc::new(ProjectedTree::build(&entries));
        debug!(directories = tree.directory_count(), "projection rebuilt");
        *self
            .snapshot
            .write()
            .expect("projection snapshot lock poisoned") = tree;
        *guard = Some(signature);
        Ok(true)
    }

    /// Listing for the callback surface: projection minus tombstones, with
    /// journal-owned entries re-stat'd from `src_root`. `None` when the
    /// directory is not projected or is itself tombstoned.
    pub fn list_directory(
        &self,
        dir: &str,
        journal: &ModifiedPathsJournal,
        src_root: &Path,
    ) -> Option<Vec<ListedEntry>> {
        if !dir.is_empty() && journal.is_under_tombstone(dir) {
            return None;
        }
        let snapshot = self.snapshot();
        let children = snapshot.children_of(dir)?;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let full = if dir.is_empty() {
                child.name.clone()
            } else {
                format!("{dir}/{}", child.name)
            };
            if journal.is_tombstoned(&full) {
                continue;
            }
            let mut row = ListedEntry {
                name: child.name.clone(),
                mode: child.mode,
                oid: child.oid,
                size: child.size as u64,
                from_disk: false,
            };
            if journal.is_modified(&full) {
                match std::fs::metadata(src_root.join(&full)) {
                    Ok(metadata) => {
                        row.size = metadata.len();
                        row.from_disk = true;
                    }
                    // Journaled but missing on disk: the projection row is
                    // the best answer we have.
                    Err(_) => {}
                }
            }
            out.push(row);
        }
        Some(out)
    }

    /// Single-shot lookup behind get-placeholder-info.
    pub fn entry_for(&self, path: &str) -> Option<ProjectedEntry> {
        self.snapshot().entry_for(path).cloned()
    }
}
