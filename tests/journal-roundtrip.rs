//! Integration tests for the modified-paths journal: the on-disk log must
//! reload into exactly the set that was appended, for hand-picked histories
//! and for randomized ones.

use std::collections::HashSet;

use gvfs_core::journal::{ModifiedPathsJournal, normalize_path};
use quickcheck::{Arbitrary, Gen, QuickCheck};

/// One journal append in a randomized history.
#[derive(Debug, Clone)]
enum Record {
    Modified(String),
    Folder(String),
    Tombstone(String),
}

impl Record {
    fn path(&self) -> &str {
        match self {
            Record::Modified(path) | Record::Folder(path) | Record::Tombstone(path) => path,
        }
    }
}

impl Arbitrary for Record {
    fn arbitrary(g: &mut Gen) -> Record {
        // Paths from a small alphabet so duplicates actually happen.
        let segments = usize::arbitrary(g) % 3 + 1;
        let mut path = String::new();
        for i in 0..segments {
            if i > 0 {
                path.push('/');
            }
            let pick = usize::arbitrary(g) % 6;
            path.push_str(["src", "docs", "a.txt", "b.c", "tool", "Makefile"][pick]);
        }
        match usize::arbitrary(g) % 3 {
            0 => Record::Modified(path),
            1 => Record::Folder(path),
            _ => Record::Tombstone(path),
        }
    }
}

/// Reopening the journal yields the same in-memory answers that were built
/// up by appends, whatever the history.
#[test]
fn randomized_histories_round_trip() {
    fn property(records: Vec<Record>) -> bool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ModifiedPaths.dat");

        let mut expected: HashSet<String> = HashSet::new();
        {
            let journal = ModifiedPathsJournal::open(&path).unwrap();
            for record in &records {
                match record {
                    Record::Modified(p) => journal.record_modified(p).unwrap(),
                    Record::Folder(p) => journal.record_folder(p).unwrap(),
                    Record::Tombstone(p) => journal.record_tombstone(p).unwrap(),
                }
                expected.insert(normalize_path(record.path()));
            }
        }

        let reopened = ModifiedPathsJournal::open(&path).unwrap();
        let actual: HashSet<String> = reopened.enumerate().into_iter().collect();
        if actual != expected {
            return false;
        }
        records.iter().all(|record| match record {
            Record::Modified(p) | Record::Folder(p) => reopened.is_modified(p),
            Record::Tombstone(p) => reopened.is_tombstoned(p),
        })
    }

    QuickCheck::new()
        .tests(50)
        .quickcheck(property as fn(Vec<Record>) -> bool);
}

/// The concrete tombstone-then-modify scenario external `status` relies on.
#[test]
fn tombstone_and_modified_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ModifiedPaths.dat");
    {
        let journal = ModifiedPathsJournal::open(&path).unwrap();
        journal.record_tombstone("docs/old.md").unwrap();
        journal.record_modified("src/new.c").unwrap();
    }
    let journal = ModifiedPathsJournal::open(&path).unwrap();
    assert!(journal.is_tombstoned("docs/old.md"));
    assert!(journal.is_modified("src/new.c"));
    assert_eq!(journal.enumerate().len(), 2);
}

/// Windows-style input normalizes to the journal form before persisting.
#[test]
fn normalization_is_stable_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ModifiedPaths.dat");
    {
        let journal = ModifiedPathsJournal::open(&path).unwrap();
        journal.record_modified(r"dir\nested\file.txt").unwrap();
    }
    let journal = ModifiedPathsJournal::open(&path).unwrap();
    assert!(journal.is_modified("dir/nested/file.txt"));
    assert!(journal.is_modified(r"dir\nested\file.txt"));
}
