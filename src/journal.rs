//! Modified-paths journal.
//!
//! An append-only log of every path the user has touched: the set of paths
//! the core may no longer answer from projection alone. Records are a one
//! byte sigil plus a NUL-terminated working-tree-relative path; the file
//! opens with a version line. Appends are fsync'd before the in-memory set
//! updates, so a crash never loses an acknowledged record. Duplicate appends
//! are allowed and cheaper than de-duplicating writes; readers de-dup here.

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
    sync::{Mutex, RwLock},
};

use tracing::warn;

use crate::errors::GvfsError;

const JOURNAL_VERSION: &[u8] = b"1\0";

const SIGIL_FILE: u8 = b'F';
const SIGIL_FOLDER: u8 = b'D';
const SIGIL_TOMBSTONE: u8 = b'X';
/// Compensates an earlier tombstone: a checkout overwrote the deleted path.
const SIGIL_REVIVE: u8 = b'R';

#[derive(Default)]
struct PathSets {
    files: HashSet<String>,
    folders: HashSet<String>,
    tombstones: HashSet<String>,
}

/// The journal plus its in-memory view.
pub struct ModifiedPathsJournal {
    writer: Mutex<File>,
    sets: RwLock<PathSets>,
}

impl ModifiedPathsJournal {
    /// Open (or create) the journal at `path` and load every record.
    pub fn open(path: &Path) -> Result<ModifiedPathsJournal, GvfsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut sets = PathSets::default();
        if contents.is_empty() {
            file.write_all(JOURNAL_VERSION)?;
            file.sync_data()?;
        } else {
            let body = contents
                .strip_prefix(JOURNAL_VERSION)
                .ok_or_else(|| GvfsError::Metadata("unknown journal version".into()))?;
            let mut cursor = 0;
            while cursor < body.len() {
                let Some(nul) = memchr::memchr(0, &body[cursor..]) else {
                    // A record missing its terminator is a torn final write.
                    warn!("dropped torn record at journal tail");
                    break;
                };
                let record = &body[cursor..cursor + nul];
                cursor += nul + 1;
                if record.is_empty() {
                    continue;
                }
                match record[0] {
                    SIGIL_FILE => {
                        sets.files.insert(record_path(record));
                    }
                    SIGIL_FOLDER => {
                        sets.folders.insert(record_path(record));
                    }
                    SIGIL_TOMBSTONE => {
                        sets.tombstones.insert(record_path(record));
                    }
                    SIGIL_REVIVE => {
                        sets.tombstones.remove(&record_path(record));
                    }
                    other => {
                        warn!(sigil = other, "skipping journal record with unknown sigil");
                    }
                }
            }
        }

        Ok(ModifiedPathsJournal {
            writer: Mutex::new(file),
            sets: RwLock::new(sets),
        })
    }

    fn append(&self, sigil: u8, normalized: &str) -> Result<(), GvfsError> {
        let mut record = Vec::with_capacity(normalized.len() + 2);
        record.push(sigil);
        record.extend_from_slice(normalized.as_bytes());
        record.push(0);

        let mut writer = self.writer.lock().expect("journal writer lock poisoned");
        writer.write_all(&record)?;
        writer.sync_data()?;
        Ok(())
    }

    /// Record a user-written file.
    pub fn record_modified(&self, path: &str) -> Result<(), GvfsError> {
        let normalized = normalize_path(path);
        self.append(SIGIL_FILE, &normalized)?;
        self.sets
            .write()
            .expect("journal set lock poisoned")
            .files
            .insert(normalized);
        Ok(())
    }

    /// Record a folder whose listing can no longer come from projection.
    pub fn record_folder(&self, path: &str) -> Result<(), GvfsError> {
        let normalized = normalize_path(path);
        self.append(SIGIL_FOLDER, &normalized)?;
        self.sets
            .write()
            .expect("journal set lock poisoned")
            .folders
            .insert(normalized);
        Ok(())
    }

    /// Record a user-deleted projected path.
    pub fn record_tombstone(&self, path: &str) -> Result<(), GvfsError> {
        let normalized = normalize_path(path);
        self.append(SIGIL_TOMBSTONE, &normalized)?;
        self.sets
            .write()
            .expect("journal set lock poisoned")
            .tombstones
            .insert(normalized);
        Ok(())
    }

    /// Overwriting a tombstoned path (checkout over a delete) revives it.
    /// The log being append-only, revival is a compensating record.
    pub fn clear_tombstone(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        let removed = self
            .sets
            .write()
            .expect("journal set lock poisoned")
            .tombstones
            .remove(&normalized);
        if removed && let Err(e) = self.append(SIGIL_REVIVE, &normalized) {
            warn!(path = %normalized, error = %e, "revive record append failed");
        }
        removed
    }

    pub fn is_modified(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        let sets = self.sets.read().expect("journal set lock poisoned");
        sets.files.contains(&normalized) || sets.folders.contains(&normalized)
    }

    pub fn is_tombstoned(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        self.sets
            .read()
            .expect("journal set lock poisoned")
            .tombstones
            .contains(&normalized)
    }

    /// True when `path` or any of its ancestors is tombstoned; a deleted
    /// directory hides everything under it.
    pub fn is_under_tombstone(&self, path: &str) -> bool {
        let normalized = normalize_path(path);
        let sets = self.sets.read().expect("journal set lock poisoned");
        let mut candidate: &str = &normalized;
        loop {
            if sets.tombstones.contains(candidate) {
                return true;
            }
            match candidate.rfind('/') {
                Some(i) => candidate = &candidate[..i],
                None => return false,
            }
        }
    }

    /// Every journaled path, de-duplicated, for `status` consumers.
    pub fn enumerate(&self) -> Vec<String> {
        let sets = self.sets.read().expect("journal set lock poisoned");
        let mut out: HashSet<String> = HashSet::new();
        out.extend(sets.files.iter().cloned());
        out.extend(sets.folders.iter().cloned());
        out.extend(sets.tombstones.iter().cloned());
        let mut out: Vec<String> = out.into_iter().collect();
        out.sort();
        out
    }

    /// Count of distinct journaled paths, for heartbeat counters.
    pub fn len(&self) -> usize {
        self.enumerate().len()
    }

    pub fn is_empty(&self) -> bool {
        let sets = self.sets.read().expect("journal set lock poisoned");
        sets.files.is_empty() && sets.folders.is_empty() && sets.tombstones.is_empty()
    }
}

fn record_path(record: &[u8]) -> String {
    String::from_utf8_lossy(&record[1..]).into_owned()
}

/// Normalize to the journal form: forward slashes, no leading separator.
pub fn normalize_path(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    replaced.trim_start_matches('/').trim_end_matches('/').to_string()
}
