//! Virtualization callback surface.
//!
//! Every kernel-filter event lands here: directory enumeration,
//! placeholder info, content streams, and write/delete notifications. The
//! driver serializes callbacks per path; across paths this surface is fully
//! reentrant. Hydration happens inside `get_file_stream`, which is the one
//! place a callback is allowed to wait on the network.

pub mod filter;
pub mod platform;

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::{
    cache::ObjectCache,
    errors::{ErrorClass, GvfsError},
    index::Projector,
    journal::{ModifiedPathsJournal, normalize_path},
    lock::{DeferredAction, WorkTreeLock},
    object::EntryMode,
    virtualize::filter::{ByteSink, EnumeratedEntry, PlaceholderInfo},
};

/// How many bytes go to the driver per chunk while streaming content.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle of the mount as the pipe router and driver observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Mounting,
    Ready,
    Unmounting,
    Unmounted,
    MountFailed,
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            MountState::Mounting => "Mounting",
            MountState::Ready => "Ready",
            MountState::Unmounting => "Unmounting",
            MountState::Unmounted => "Unmounted",
            MountState::MountFailed => "MountFailed",
        };
        f.write_str(name)
    }
}

/// Hydration state of one working-tree path. Transitions are one-way except
/// `Tombstone → Full` when a checkout overwrites a deleted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderState {
    /// Phantom: projected, nothing on disk.
    Virtual,
    /// Placeholder written, content not yet streamed.
    Partial,
    /// Content materialized and tracked by the filter as hydrated.
    Full,
    /// User-written; the journal owns this path now.
    Modified,
    /// User-deleted.
    Tombstone,
}

/// The engine behind every filter callback.
pub struct Virtualizer {
    projector: Arc<Projector>,
    journal: Arc<ModifiedPathsJournal>,
    cache: ObjectCache,
    lock: WorkTreeLock,
    src_root: PathBuf,
    state: Mutex<MountState>,
    placeholders: DashMap<String, PlaceholderState>,
    active_callbacks: AtomicUsize,
    /// Fired when a callback surfaces a fatal error; the mount owner tears
    /// everything down on it.
    fatal: Arc<Notify>,
}

/// Tracks an in-flight callback so unmount can drain them.
struct CallbackGuard<'a>(&'a AtomicUsize);

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Virtualizer {
    pub fn new(
        projector: Arc<Projector>,
        journal: Arc<ModifiedPathsJournal>,
        cache: ObjectCache,
        lock: WorkTreeLock,
        src_root: PathBuf,
    ) -> Virtualizer {
        Virtualizer {
            projector,
            journal,
            cache,
            lock,
            src_root,
            state: Mutex::new(MountState::Mounting),
            placeholders: DashMap::new(),
            active_callbacks: AtomicUsize::new(0),
            fatal: Arc::new(Notify::new()),
        }
    }

    /// Fires once a fatal failure has been reported. The permit is stored,
    /// so a listener that registers after the failure still wakes.
    pub fn fatal_signal(&self) -> Arc<Notify> {
        self.fatal.clone()
    }

    /// Classify a failure that is about to surface. Corruption is traced as
    /// critical but only fails its request; a broken invariant flips the
    /// mount to MountFailed and wakes the teardown listener.
    pub fn report_failure(&self, failure: &GvfsError) {
        match failure.class() {
            ErrorClass::Fatal => {
                error!(error = %failure, "invariant broken; taking the mount down");
                self.set_state(MountState::MountFailed);
                self.fatal.notify_one();
            }
            ErrorClass::Corruption => {
                error!(error = %failure, "corruption detected; failing this request");
            }
            _ => {}
        }
    }

    /// Route a callback result through [`Virtualizer::report_failure`] on its
    /// way to the driver.
    fn surface<T>(&self, result: Result<T, GvfsError>) -> Result<T, GvfsError> {
        if let Err(failure) = &result {
            self.report_failure(failure);
        }
        result
    }

    pub fn mount_state(&self) -> MountState {
        *self.state.lock().expect("mount state lock poisoned")
    }

    pub fn set_state(&self, state: MountState) {
        info!(state = %state, "mount state change");
        *self.state.lock().expect("mount state lock poisoned") = state;
    }

    /// Terminal shutdown: flip to Unmounting, wait for in-flight callbacks
    /// to drain, then report Unmounted. New callbacks fail fast meanwhile.
    pub async fn begin_unmount(&self) {
        self.set_state(MountState::Unmounting);
        while self.active_callbacks.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.set_state(MountState::Unmounted);
    }

    fn ensure_ready(&self) -> Result<(), GvfsError> {
        let state = self.mount_state();
        match state {
            MountState::Ready => Ok(()),
            MountState::Unmounting => Err(GvfsError::UnmountInProgress),
            other => Err(GvfsError::MountNotReady(other.to_string())),
        }
    }

    fn enter(&self) -> Result<CallbackGuard<'_>, GvfsError> {
        self.ensure_ready()?;
        self.active_callbacks.fetch_add(1, Ordering::AcqRel);
        Ok(CallbackGuard(&self.active_callbacks))
    }

    /// Apply anything an external lock release queued (projection refresh
    /// after an external checkout). Runs at the top of read callbacks.
    fn drain_deferred(&self) {
        for action in self.lock.drain_deferred() {
            match action {
                DeferredAction::RefreshProjection => {
                    if let Err(e) = self.projector.refresh(true) {
                        warn!(error = %e, "deferred projection refresh failed");
                    }
                }
            }
        }
    }

    /// Hydration state for a path, defaulting phantom entries to Virtual.
    pub fn placeholder_state(&self, path: &str) -> PlaceholderState {
        let normalized = normalize_path(path);
        self.placeholders
            .get(&normalized)
            .map(|entry| *entry)
            .unwrap_or(PlaceholderState::Virtual)
    }

    /// EnumerateDirectory: ordered projection rows minus tombstones, with
    /// journal-owned rows re-stat'd from disk.
    pub async fn enumerate_directory(
        &self,
        path: &str,
    ) -> Result<Vec<EnumeratedEntry>, GvfsError> {
        let _guard = self.enter()?;
        self.drain_deferred();
        let dir = normalize_path(path);
        let listing = self
            .projector
            .list_directory(&dir, &self.journal, &self.src_root)
            .ok_or_else(|| GvfsError::PathNotProjected(dir.clone()))?;
        Ok(listing
            .into_iter()
            .map(|row| EnumeratedEntry {
                is_directory: row.mode.is_directory(),
                name: row.name,
                size: row.size,
                mode: row.mode,
            })
            .collect())
    }

    /// GetPlaceholderInfo: type/size/mode from projection. NOT_FOUND when the
    /// path is neither projected nor journal-owned. Marks the path Partial:
    /// the driver is about to write a placeholder for it.
    pub async fn get_placeholder_info(
        &self,
        path: &str,
    ) -> Result<PlaceholderInfo, GvfsError> {
        let _guard = self.enter()?;
        self.drain_deferred();
        let normalized = normalize_path(path);
        if self.journal.is_under_tombstone(&normalized) {
            return Err(GvfsError::PathNotProjected(normalized));
        }
        let entry = self
            .projector
            .entry_for(&normalized)
            .ok_or_else(|| GvfsError::PathNotProjected(normalized.clone()))?;

        let is_directory = entry.mode.is_directory();
        let size = if is_directory {
            0
        } else if entry.size > 0 {
            entry.size as u64
        } else {
            self.cache.known_size(&entry.oid).unwrap_or(0)
        };
        if !is_directory {
            self.placeholders
                .entry(normalized)
                .or_insert(PlaceholderState::Partial);
        }
        Ok(PlaceholderInfo {
            oid: entry.oid,
            mode: entry.mode,
            size,
            is_directory,
        })
    }

    /// GetFileStream: the hydration point. Ensures the object locally (the
    /// one callback allowed to wait on a download), then streams the
    /// requested range to the driver in chunks. Success moves the path to
    /// Full; failure leaves it Partial so the driver can retry.
    pub async fn get_file_stream(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        sink: &mut dyn ByteSink,
    ) -> Result<u64, GvfsError> {
        let _guard = self.enter()?;
        let normalized = normalize_path(path);
        let entry = self
            .projector
            .entry_for(&normalized)
            .ok_or_else(|| GvfsError::PathNotProjected(normalized.clone()))?;
        if entry.mode == EntryMode::Subtree {
            return Err(GvfsError::InvalidRequest(format!(
                "{normalized} is a directory"
            )));
        }

        let (_, data) = self.surface(self.cache.read(entry.oid).await)?;
        let start = offset.min(data.len() as u64) as usize;
        let end = (offset.saturating_add(length)).min(data.len() as u64) as usize;

        let mut written = 0u64;
        for chunk in data[start..end].chunks(STREAM_CHUNK_SIZE) {
            sink.write_chunk(chunk).await?;
            written += chunk.len() as u64;
        }

        self.placeholders
            .insert(normalized.clone(), PlaceholderState::Full);
        debug!(path = %normalized, bytes = written, "hydrated");
        Ok(written)
    }

    /// NotifyFileModified: the journal owns the path from here on.
    pub fn notify_file_modified(&self, path: &str) -> Result<(), GvfsError> {
        let _guard = self.enter()?;
        let normalized = normalize_path(path);
        self.surface(self.journal.record_modified(&normalized))?;
        self.placeholders
            .insert(normalized, PlaceholderState::Modified);
        Ok(())
    }

    /// NotifyNewFile: a user-created entry (or a checkout overwriting a
    /// tombstone, which revives the path).
    pub fn notify_new_file(&self, path: &str, is_directory: bool) -> Result<(), GvfsError> {
        let _guard = self.enter()?;
        let normalized = normalize_path(path);
        if self.journal.clear_tombstone(&normalized) {
            // Checkout-overwrite: the one transition back out of Tombstone.
            self.placeholders
                .insert(normalized.clone(), PlaceholderState::Full);
        }
        if is_directory {
            self.surface(self.journal.record_folder(&normalized))?;
        } else {
            self.surface(self.journal.record_modified(&normalized))?;
            self.placeholders
                .entry(normalized)
                .or_insert(PlaceholderState::Modified);
        }
        Ok(())
    }

    /// NotifyRename: tombstone the source when it was projected; the target
    /// becomes journal-owned.
    pub fn notify_file_renamed(
        &self,
        from: &str,
        to: &str,
        is_directory: bool,
    ) -> Result<(), GvfsError> {
        let _guard = self.enter()?;
        let source = normalize_path(from);
        if self.projector.entry_for(&source).is_some() {
            self.surface(self.journal.record_tombstone(&source))?;
            self.placeholders
                .insert(source, PlaceholderState::Tombstone);
        }
        let target = normalize_path(to);
        if is_directory {
            self.surface(self.journal.record_folder(&target))?;
        } else {
            self.surface(self.journal.record_modified(&target))?;
            self.placeholders
                .insert(target, PlaceholderState::Modified);
        }
        Ok(())
    }

    /// NotifyHardLinkCreated: the new name is user content.
    pub fn notify_hardlink_created(&self, path: &str) -> Result<(), GvfsError> {
        let _guard = self.enter()?;
        let normalized = normalize_path(path);
        self.surface(self.journal.record_modified(&normalized))?;
        self.placeholders
            .insert(normalized, PlaceholderState::Modified);
        Ok(())
    }

    /// NotifyFileDeleted: tombstone, from any prior state.
    pub fn notify_file_deleted(&self, path: &str) -> Result<(), GvfsError> {
        let _guard = self.enter()?;
        let normalized = normalize_path(path);
        self.surface(self.journal.record_tombstone(&normalized))?;
        self.placeholders
            .insert(normalized, PlaceholderState::Tombstone);
        Ok(())
    }

    /// NotifyPreDelete: deny deletion of the enlistment root and `.git`.
    pub fn notify_pre_delete(&self, path: &str) -> Result<(), GvfsError> {
        let _guard = self.enter()?;
        let normalized = normalize_path(path);
        if normalized.is_empty() || normalized == ".git" || normalized.starts_with(".git/") {
            return Err(GvfsError::InvalidRequest(format!(
                "deletion of `{}` is not allowed",
                if normalized.is_empty() {
                    "<root>"
                } else {
                    &normalized
                }
            )));
        }
        Ok(())
    }

    /// Counters for the heartbeat.
    pub fn active_callbacks(&self) -> usize {
        self.active_callbacks.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{
        cache::{BlobSizes, ObjectFetcher},
        index::format::tests::build_index,
        object::{ObjectKind, store::ObjectStore},
        oid::ObjectId,
        virtualize::filter::BufferSink,
        zlib,
    };

    struct ServiceStub {
        objects: std::collections::HashMap<ObjectId, Vec<u8>>,
        object_calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectFetcher for ServiceStub {
        async fn fetch_object(&self, oid: &ObjectId) -> Result<Bytes, GvfsError> {
            self.object_calls.fetch_add(1, Ordering::SeqCst);
            match self.objects.get(oid) {
                Some(data) => Ok(Bytes::from(
                    zlib::deflate_loose(ObjectKind::Blob, data).unwrap(),
                )),
                None => Err(GvfsError::ObjectNotFound(oid.to_string())),
            }
        }

        async fn fetch_batch(&self, _oids: &[ObjectId]) -> Result<Bytes, GvfsError> {
            Err(GvfsError::ServerError(500))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        virtualizer: Virtualizer,
        journal: Arc<ModifiedPathsJournal>,
        stub_calls: Arc<ServiceStub>,
    }

    /// Build a mount around one projected file `a/b.txt` whose content lives
    /// only on the stubbed object service.
    fn fixture(content: &[u8]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let objects_dir = dir.path().join("objects");
        std::fs::create_dir_all(objects_dir.join("pack")).unwrap();
        let store = Arc::new(ObjectStore::open(objects_dir, "git".into()).unwrap());

        let oid = ObjectId::for_object(ObjectKind::Blob, content);
        let mut objects = std::collections::HashMap::new();
        objects.insert(oid, content.to_vec());
        let stub = Arc::new(ServiceStub {
            objects,
            object_calls: AtomicU32::new(0),
        });

        let index_path = dir.path().join("index");
        let unfetchable = ObjectId::digest(b"not on the service");
        std::fs::write(
            &index_path,
            build_index(
                4,
                &[
                    ("a/b.txt", oid, 0o100644, true, content.len() as u32),
                    ("a/unfetchable.bin", unfetchable, 0o100644, true, 9),
                    ("top.txt", oid, 0o100644, true, content.len() as u32),
                ],
            ),
        )
        .unwrap();

        let src_root = dir.path().join("src");
        std::fs::create_dir_all(&src_root).unwrap();
        let journal = Arc::new(
            ModifiedPathsJournal::open(&dir.path().join("ModifiedPaths.dat")).unwrap(),
        );
        let sizes = BlobSizes::open(&dir.path().join("BlobSizes.dat")).unwrap();
        let cache = ObjectCache::new(
            store,
            stub.clone(),
            sizes,
            Duration::from_millis(1),
        );
        let projector = Arc::new(Projector::load(index_path).unwrap());
        let virtualizer = Virtualizer::new(
            projector,
            journal.clone(),
            cache,
            WorkTreeLock::new(),
            src_root,
        );
        virtualizer.set_state(MountState::Ready);
        Fixture {
            _dir: dir,
            virtualizer,
            journal,
            stub_calls: stub,
        }
    }

    /// First read hydrates from the service: bytes streamed, Partial→Full,
    /// no journal append.
    #[tokio::test]
    async fn test_hydration_on_first_read() {
        let content = vec![0xA5u8; 42];
        let fx = fixture(&content);

        let info = fx.virtualizer.get_placeholder_info("a/b.txt").await.unwrap();
        assert_eq!(info.size, 42);
        assert_eq!(
            fx.virtualizer.placeholder_state("a/b.txt"),
            PlaceholderState::Partial
        );

        let mut sink = BufferSink::default();
        let written = fx
            .virtualizer
            .get_file_stream("a/b.txt", 0, 42, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 42);
        assert_eq!(sink.bytes, content);
        assert_eq!(fx.stub_calls.object_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.virtualizer.placeholder_state("a/b.txt"),
            PlaceholderState::Full
        );
        assert!(fx.journal.is_empty());

        // Second read answers locally.
        let mut sink = BufferSink::default();
        fx.virtualizer
            .get_file_stream("a/b.txt", 0, 42, &mut sink)
            .await
            .unwrap();
        assert_eq!(fx.stub_calls.object_calls.load(Ordering::SeqCst), 1);
    }

    /// Range requests clamp to the object and honor offsets.
    #[tokio::test]
    async fn test_stream_range() {
        let fx = fixture(b"0123456789");
        let mut sink = BufferSink::default();
        let written = fx
            .virtualizer
            .get_file_stream("a/b.txt", 2, 5, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(sink.bytes, b"23456");

        let mut sink = BufferSink::default();
        let written = fx
            .virtualizer
            .get_file_stream("a/b.txt", 8, 100, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, 2);
    }

    /// A failed hydration reports an error and stays Partial for retry; an
    /// unprojected path is NOT_FOUND.
    #[tokio::test]
    async fn test_failed_hydration_stays_partial() {
        let fx = fixture(b"present");
        fx.virtualizer
            .get_placeholder_info("a/unfetchable.bin")
            .await
            .unwrap();
        let mut sink = BufferSink::default();
        assert!(
            fx.virtualizer
                .get_file_stream("a/unfetchable.bin", 0, 9, &mut sink)
                .await
                .is_err()
        );
        assert_eq!(
            fx.virtualizer.placeholder_state("a/unfetchable.bin"),
            PlaceholderState::Partial
        );

        let err = fx
            .virtualizer
            .get_file_stream("a/missing.txt", 0, 1, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, GvfsError::PathNotProjected(_)));
    }

    /// Enumeration lists projection rows and drops tombstones.
    #[tokio::test]
    async fn test_enumerate_with_tombstones() {
        let fx = fixture(b"content");
        let root = fx.virtualizer.enumerate_directory("").await.unwrap();
        assert_eq!(root.len(), 2);
        assert!(root[0].is_directory);
        assert_eq!(root[0].name, "a");

        fx.virtualizer.notify_file_deleted("top.txt").unwrap();
        let root = fx.virtualizer.enumerate_directory("").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(
            fx.virtualizer.placeholder_state("top.txt"),
            PlaceholderState::Tombstone
        );
    }

    /// Modification notifications journal the path and flip its state.
    #[tokio::test]
    async fn test_notify_modified_and_new() {
        let fx = fixture(b"content");
        fx.virtualizer.notify_file_modified("a/b.txt").unwrap();
        assert!(fx.journal.is_modified("a/b.txt"));
        assert_eq!(
            fx.virtualizer.placeholder_state("a/b.txt"),
            PlaceholderState::Modified
        );

        fx.virtualizer.notify_new_file("brand/new.txt", false).unwrap();
        assert!(fx.journal.is_modified("brand/new.txt"));
        fx.virtualizer.notify_new_file("brand", true).unwrap();
        assert!(fx.journal.is_modified("brand"));
    }

    /// Rename tombstones the projected source and journals the target.
    #[tokio::test]
    async fn test_notify_rename() {
        let fx = fixture(b"content");
        fx.virtualizer
            .notify_file_renamed("a/b.txt", "a/renamed.txt", false)
            .unwrap();
        assert!(fx.journal.is_tombstoned("a/b.txt"));
        assert!(fx.journal.is_modified("a/renamed.txt"));
    }

    /// Checkout-overwrite revives a tombstoned path (Tombstone → Full).
    #[tokio::test]
    async fn test_tombstone_revival() {
        let fx = fixture(b"content");
        fx.virtualizer.notify_file_deleted("a/b.txt").unwrap();
        assert_eq!(
            fx.virtualizer.placeholder_state("a/b.txt"),
            PlaceholderState::Tombstone
        );
        fx.virtualizer.notify_new_file("a/b.txt", false).unwrap();
        assert_eq!(
            fx.virtualizer.placeholder_state("a/b.txt"),
            PlaceholderState::Full
        );
        assert!(!fx.journal.is_tombstoned("a/b.txt"));
    }

    /// PreDelete denies the enlistment root and the git dir.
    #[tokio::test]
    async fn test_pre_delete_denials() {
        let fx = fixture(b"content");
        assert!(fx.virtualizer.notify_pre_delete("").is_err());
        assert!(fx.virtualizer.notify_pre_delete(".git").is_err());
        assert!(fx.virtualizer.notify_pre_delete(".git/config").is_err());
        assert!(fx.virtualizer.notify_pre_delete("a/b.txt").is_ok());
    }

    /// Callbacks fail fast once unmount begins; drain completes.
    #[tokio::test]
    async fn test_unmount_gating() {
        let fx = fixture(b"content");
        fx.virtualizer.begin_unmount().await;
        assert_eq!(fx.virtualizer.mount_state(), MountState::Unmounted);
        let err = fx.virtualizer.enumerate_directory("").await.unwrap_err();
        assert!(matches!(err, GvfsError::MountNotReady(_)));
    }

    /// A fatal failure flips the mount to MountFailed and wakes the teardown
    /// listener; non-fatal failures leave the mount serving.
    #[tokio::test]
    async fn test_fatal_failure_sink() {
        let fx = fixture(b"content");

        // A corrupt object fails its request only.
        fx.virtualizer.report_failure(&GvfsError::CorruptObject(
            "deadbeef".into(),
            "bad zlib".into(),
        ));
        assert_eq!(fx.virtualizer.mount_state(), MountState::Ready);

        let signal = fx.virtualizer.fatal_signal();
        fx.virtualizer
            .report_failure(&GvfsError::Invariant("placeholder state went backwards".into()));
        assert_eq!(fx.virtualizer.mount_state(), MountState::MountFailed);
        // The permit is stored, so a listener arriving late still wakes.
        tokio::time::timeout(Duration::from_secs(1), signal.notified())
            .await
            .unwrap();

        let err = fx.virtualizer.enumerate_directory("").await.unwrap_err();
        match err {
            GvfsError::MountNotReady(state) => assert_eq!(state, "MountFailed"),
            other => panic!("expected MountNotReady, got {other:?}"),
        }
    }

    /// Callbacks before Ready are rejected with the current state.
    #[tokio::test]
    async fn test_not_ready_gating() {
        let fx = fixture(b"content");
        fx.virtualizer.set_state(MountState::Mounting);
        let err = fx
            .virtualizer
            .get_placeholder_info("a/b.txt")
            .await
            .unwrap_err();
        match err {
            GvfsError::MountNotReady(state) => assert_eq!(state, "Mounting"),
            other => panic!("expected MountNotReady, got {other:?}"),
        }
    }
}
