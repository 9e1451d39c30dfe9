//! Named-pipe request router.
//!
//! Hook processes and the CLI talk to a mounted enlistment over a
//! per-enlistment pipe (a Unix domain socket here; a named pipe slots behind
//! the same framing on Windows). Frames are a u32-LE length prefix around
//! `Header\0Body`, where the body may carry further NUL-separated fields.
//! Handlers are serialized per connection; connections run concurrently.
//! Every verb except `GetStatus` and `Unmount` requires the mount to be
//! Ready.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Notify,
};
use tracing::{debug, info, warn};

use crate::{
    cache::ObjectCache,
    errors::GvfsError,
    index::Projector,
    journal::ModifiedPathsJournal,
    lock::{LockAcquireResult, LockData, WorkTreeLock},
    maintenance::{MaintenanceScheduler, MaintenanceStep, PostFetchStep},
    oid::ObjectId,
    virtualize::{MountState, Virtualizer},
};

/// Largest frame a client may send.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Static facts reported by `GetStatus`.
#[derive(Debug, Clone)]
pub struct StatusSource {
    pub enlistment_root: String,
    pub local_cache_root: String,
    pub repo_url: String,
    pub cache_server: String,
    pub disk_layout_version: u32,
}

/// The verb dispatcher. One per mount, shared by all connections.
pub struct IpcRouter {
    virtualizer: Arc<Virtualizer>,
    lock: WorkTreeLock,
    journal: Arc<ModifiedPathsJournal>,
    cache: ObjectCache,
    projector: Arc<Projector>,
    scheduler: Arc<MaintenanceScheduler>,
    adhoc: tokio::sync::mpsc::UnboundedSender<Arc<dyn MaintenanceStep>>,
    status: StatusSource,
    /// Signalled when a client asks for unmount; the mount owner listens.
    pub unmount_requested: Arc<Notify>,
}

impl IpcRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        virtualizer: Arc<Virtualizer>,
        lock: WorkTreeLock,
        journal: Arc<ModifiedPathsJournal>,
        cache: ObjectCache,
        projector: Arc<Projector>,
        scheduler: Arc<MaintenanceScheduler>,
        adhoc: tokio::sync::mpsc::UnboundedSender<Arc<dyn MaintenanceStep>>,
        status: StatusSource,
    ) -> IpcRouter {
        IpcRouter {
            virtualizer,
            lock,
            journal,
            cache,
            projector,
            scheduler,
            adhoc,
            status,
            unmount_requested: Arc::new(Notify::new()),
        }
    }

    /// Split one frame payload into header and body.
    fn split_frame(payload: &[u8]) -> (String, String) {
        match memchr::memchr(0, payload) {
            Some(nul) => (
                String::from_utf8_lossy(&payload[..nul]).into_owned(),
                String::from_utf8_lossy(&payload[nul + 1..]).into_owned(),
            ),
            None => (String::from_utf8_lossy(payload).into_owned(), String::new()),
        }
    }

    /// Handle one request frame and produce the response payload.
    pub async fn handle_frame(&self, payload: &[u8]) -> Vec<u8> {
        let (header, body) = Self::split_frame(payload);
        debug!(header = %header, "pipe request");
        let response = self.dispatch(&header, &body).await;
        response.into_bytes()
    }

    async fn dispatch(&self, header: &str, body: &str) -> String {
        // Mount-state gate: status and unmount are always answerable.
        let state = self.virtualizer.mount_state();
        let exempt = matches!(header, "GetStatus" | "Unmount");
        if !exempt && state != MountState::Ready {
            return match (header, state) {
                ("AcquireLock", MountState::Unmounting) => "UnmountInProgress".to_string(),
                _ => "MountNotReady".to_string(),
            };
        }

        match header {
            "AcquireLock" => self.handle_acquire_lock(body),
            "ReleaseLock" => self.handle_release_lock(body),
            "QueryLockAvailability" => self.handle_query_availability(),
            "DownloadObject" => self.handle_download_object(body).await,
            "GetStatus" => self.handle_get_status(),
            "ModifiedPaths" => self.handle_modified_paths(body),
            "PostIndexChanged" => self.handle_post_index_changed(),
            "RunPostFetchJob" => self.handle_run_post_fetch(body),
            "Unmount" => self.handle_unmount(),
            _ => "UnknownRequest".to_string(),
        }
    }

    fn handle_acquire_lock(&self, body: &str) -> String {
        let data = match LockData::from_body(body) {
            Ok(data) => data,
            Err(_) => return "Deny\0InvalidLockData".to_string(),
        };
        match self.lock.try_acquire(data) {
            LockAcquireResult::Accepted => "Accept".to_string(),
            LockAcquireResult::DeniedByEngine => "Deny\0GVFS".to_string(),
            LockAcquireResult::DeniedByExternal { holder } => format!("Deny\0Git\0{holder}"),
            LockAcquireResult::Availability { available } => {
                format!("AvailabilityResult\0{available}")
            }
        }
    }

    fn handle_release_lock(&self, body: &str) -> String {
        let Ok(data) = LockData::from_body(body) else {
            return "Failure".to_string();
        };
        if self.lock.release(data.pid) {
            "Success".to_string()
        } else {
            "Failure".to_string()
        }
    }

    fn handle_query_availability(&self) -> String {
        let available = self.lock.holder().is_none();
        format!("AvailabilityResult\0{available}")
    }

    async fn handle_download_object(&self, body: &str) -> String {
        let Ok(oid) = body.trim().parse::<ObjectId>() else {
            return "InvalidSHA".to_string();
        };
        match self.cache.ensure(oid).await {
            Ok(()) => "Success".to_string(),
            Err(e) => {
                warn!(oid = %oid, error = %e, "requested object download failed");
                format!("DownloadFailed\0{e}")
            }
        }
    }

    fn handle_get_status(&self) -> String {
        let lock_status = match self.lock.holder() {
            Some(holder) => format!("Held by {} (pid {})", holder.command, holder.pid),
            None => "Free".to_string(),
        };
        serde_json::json!({
            "EnlistmentRoot": self.status.enlistment_root,
            "LocalCacheRoot": self.status.local_cache_root,
            "RepoUrl": self.status.repo_url,
            "CacheServer": self.status.cache_server,
            "LockStatus": lock_status,
            "DiskLayoutVersion": self.status.disk_layout_version,
            "MountStatus": self.virtualizer.mount_state().to_string(),
            "BackgroundOperationCount": self.cache.in_flight(),
        })
        .to_string()
    }

    fn handle_modified_paths(&self, body: &str) -> String {
        if body.trim() != "1" {
            return "InvalidVersion".to_string();
        }
        self.journal.enumerate().join("\0")
    }

    fn handle_post_index_changed(&self) -> String {
        // The rebuild is an internal write; while an external process holds
        // the work-tree lock the refresh is deferred to its release.
        match self.lock.try_acquire_internal() {
            Some(_guard) => match self.projector.refresh(true) {
                Ok(_) => "Success".to_string(),
                Err(e) => {
                    warn!(error = %e, "projection rebuild failed");
                    "Failure".to_string()
                }
            },
            None => {
                debug!("index-changed during external lock; refresh deferred");
                "Success".to_string()
            }
        }
    }

    fn handle_run_post_fetch(&self, body: &str) -> String {
        // Body is a JSON array of pack indexes that the prefetch produced.
        if serde_json::from_str::<Vec<String>>(body).is_err() {
            return "Failure".to_string();
        }
        match self.adhoc.send(Arc::new(PostFetchStep)) {
            Ok(()) => "Success".to_string(),
            Err(_) => "Failure".to_string(),
        }
    }

    fn handle_unmount(&self) -> String {
        match self.virtualizer.mount_state() {
            MountState::Ready => {
                info!("unmount requested over pipe");
                self.unmount_requested.notify_waiters();
                "Success".to_string()
            }
            MountState::Unmounting => "UnmountInProgress".to_string(),
            other => format!("MountNotReady\0{other}"),
        }
    }

    /// The scheduler behind RunPostFetchJob, for embedders that run steps
    /// synchronously.
    pub fn scheduler(&self) -> &Arc<MaintenanceScheduler> {
        &self.scheduler
    }
}

/// The pipe name derived from the enlistment path: stable per enlistment,
/// collision-free across them.
pub fn pipe_path_for(enlistment_root: &Path) -> PathBuf {
    let digest = ObjectId::digest(enlistment_root.to_string_lossy().as_bytes());
    std::env::temp_dir().join(format!("gvfs_{:.16}.sock", digest.to_string()))
}

/// Accept loop over the enlistment pipe.
pub struct IpcServer {
    path: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl IpcServer {
    /// Bind the pipe and start accepting. A stale socket from a dead mount
    /// is removed first.
    #[cfg(unix)]
    pub fn serve(router: Arc<IpcRouter>, path: PathBuf) -> Result<IpcServer, GvfsError> {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        info!(pipe = %path.display(), "pipe listening");
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let router = router.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(router, stream).await;
                });
            }
        });
        Ok(IpcServer { path, task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket.
    pub fn shutdown(self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Serve one connection: length-prefixed request/response until EOF. A closed
/// connection aborts whatever was pending on it.
#[cfg(unix)]
async fn serve_connection(
    router: Arc<IpcRouter>,
    mut stream: tokio::net::UnixStream,
) -> Result<(), GvfsError> {
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(_) => return Ok(()), // client went away
        }
        let len = u32::from_le_bytes(len_bytes);
        if len == 0 || len > MAX_FRAME_BYTES {
            return Err(GvfsError::InvalidRequest(format!("bad frame length {len}")));
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;

        let response = router.handle_frame(&payload).await;
        stream
            .write_all(&(response.len() as u32).to_le_bytes())
            .await?;
        stream.write_all(&response).await?;
    }
}

/// Client-side helper used by tests and the hook surface: one framed
/// round-trip.
#[cfg(unix)]
pub async fn request(path: &Path, header: &str, body: &str) -> Result<String, GvfsError> {
    let mut stream = tokio::net::UnixStream::connect(path).await?;
    let mut payload = Vec::with_capacity(header.len() + body.len() + 1);
    payload.extend_from_slice(header.as_bytes());
    if !body.is_empty() {
        payload.push(0);
        payload.extend_from_slice(body.as_bytes());
    }
    stream
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    stream.write_all(&payload).await?;

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(GvfsError::InvalidRequest(format!("bad frame length {len}")));
    }
    let mut response = vec![0u8; len as usize];
    stream.read_exact(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        cache::{BlobSizes, ObjectCache, ObjectFetcher},
        index::format::tests::build_index,
        maintenance::MaintenanceContext,
        object::store::ObjectStore,
    };

    struct NoService;

    #[async_trait::async_trait]
    impl ObjectFetcher for NoService {
        async fn fetch_object(
            &self,
            oid: &ObjectId,
        ) -> Result<bytes::Bytes, GvfsError> {
            Err(GvfsError::ObjectNotFound(oid.to_string()))
        }

        async fn fetch_batch(&self, _oids: &[ObjectId]) -> Result<bytes::Bytes, GvfsError> {
            Err(GvfsError::ServerError(500))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        _adhoc_rx: tokio::sync::mpsc::UnboundedReceiver<Arc<dyn MaintenanceStep>>,
        router: Arc<IpcRouter>,
        virtualizer: Arc<Virtualizer>,
        lock: WorkTreeLock,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let objects = dir.path().join("objects");
        std::fs::create_dir_all(objects.join("pack")).unwrap();
        let store = Arc::new(ObjectStore::open(objects, "git".into()).unwrap());

        let index_path = dir.path().join("index");
        std::fs::write(
            &index_path,
            build_index(4, &[("a.txt", ObjectId([7; 20]), 0o100644, true, 5)]),
        )
        .unwrap();
        let projector = Arc::new(Projector::load(index_path).unwrap());
        let journal = Arc::new(
            ModifiedPathsJournal::open(&dir.path().join("ModifiedPaths.dat")).unwrap(),
        );
        let sizes = BlobSizes::open(&dir.path().join("BlobSizes.dat")).unwrap();
        let cache = ObjectCache::new(
            store.clone(),
            Arc::new(NoService),
            sizes,
            Duration::from_millis(1),
        );
        let lock = WorkTreeLock::new();
        let src_root = dir.path().join("src");
        std::fs::create_dir_all(&src_root).unwrap();
        let virtualizer = Arc::new(Virtualizer::new(
            projector.clone(),
            journal.clone(),
            cache.clone(),
            lock.clone(),
            src_root,
        ));
        virtualizer.set_state(MountState::Ready);

        let ctx = Arc::new(MaintenanceContext {
            store,
            git_binary: "/bin/echo".into(),
            git_dir: dir.path().join(".git"),
            enlistment_root: dir.path().to_path_buf(),
            hooks_dir: dir.path().join("hooks"),
            repack_batch_size: "2g".into(),
            status_cache_path: None,
        });
        let scheduler = Arc::new(MaintenanceScheduler::with_default_steps(
            ctx,
            dir.path().join("times"),
        ));
        let (adhoc_tx, adhoc_rx) = tokio::sync::mpsc::unbounded_channel();

        let router = Arc::new(IpcRouter::new(
            virtualizer.clone(),
            lock.clone(),
            journal,
            cache,
            projector,
            scheduler,
            adhoc_tx,
            StatusSource {
                enlistment_root: dir.path().display().to_string(),
                local_cache_root: "/cache".into(),
                repo_url: "https://example.com/repo".into(),
                cache_server: "None".into(),
                disk_layout_version: 16,
            },
        ));
        Fixture {
            _dir: dir,
            _adhoc_rx: adhoc_rx,
            router,
            virtualizer,
            lock,
        }
    }

    async fn send(fx: &Fixture, header: &str, body: &str) -> String {
        let mut payload = header.as_bytes().to_vec();
        if !body.is_empty() {
            payload.push(0);
            payload.extend_from_slice(body.as_bytes());
        }
        String::from_utf8(fx.router.handle_frame(&payload).await).unwrap()
    }

    /// Lock verbs: accept, deny with holder, release.
    #[tokio::test]
    async fn test_lock_verbs() {
        let fx = fixture();
        let body = LockData {
            pid: 321,
            command: "git status".into(),
            is_elevated: false,
            check_availability_only: false,
        }
        .to_body();
        assert_eq!(send(&fx, "AcquireLock", &body).await, "Accept");

        let second = LockData {
            pid: 654,
            command: "git fetch".into(),
            is_elevated: false,
            check_availability_only: false,
        }
        .to_body();
        let denial = send(&fx, "AcquireLock", &second).await;
        assert!(denial.starts_with("Deny\0Git\0"));
        assert!(denial.contains("git status"));

        assert_eq!(send(&fx, "ReleaseLock", &second).await, "Failure");
        assert_eq!(send(&fx, "ReleaseLock", &body).await, "Success");
    }

    /// AcquireLock during unmount answers UnmountInProgress and grants
    /// nothing.
    #[tokio::test]
    async fn test_lock_denied_during_unmount() {
        let fx = fixture();
        fx.virtualizer.set_state(MountState::Unmounting);
        let body = LockData {
            pid: 1234,
            command: "git add .".into(),
            is_elevated: false,
            check_availability_only: false,
        }
        .to_body();
        assert_eq!(send(&fx, "AcquireLock", &body).await, "UnmountInProgress");
        assert!(fx.lock.holder().is_none());
        assert_eq!(fx.virtualizer.mount_state(), MountState::Unmounting);
    }

    /// Everything but GetStatus/Unmount gates on Ready.
    #[tokio::test]
    async fn test_mount_not_ready_gate() {
        let fx = fixture();
        fx.virtualizer.set_state(MountState::Mounting);
        assert_eq!(
            send(&fx, "DownloadObject", &"ab".repeat(20)).await,
            "MountNotReady"
        );
        assert_eq!(send(&fx, "ModifiedPaths", "1").await, "MountNotReady");
        // Exempt verbs still answer.
        let status = send(&fx, "GetStatus", "").await;
        assert!(status.contains("\"MountStatus\":\"Mounting\""));
    }

    /// DownloadObject validates the SHA before touching the cache.
    #[tokio::test]
    async fn test_download_object() {
        let fx = fixture();
        assert_eq!(send(&fx, "DownloadObject", "not-a-sha").await, "InvalidSHA");
        let response = send(&fx, "DownloadObject", &"ab".repeat(20)).await;
        assert!(response.starts_with("DownloadFailed\0"));
    }

    /// ModifiedPaths speaks version 1 only.
    #[tokio::test]
    async fn test_modified_paths_versions() {
        let fx = fixture();
        assert_eq!(send(&fx, "ModifiedPaths", "2").await, "InvalidVersion");
        assert_eq!(send(&fx, "ModifiedPaths", "1").await, "");

        fx.router.journal.record_modified("x/y.txt").unwrap();
        fx.router.journal.record_tombstone("gone.txt").unwrap();
        let listing = send(&fx, "ModifiedPaths", "1").await;
        let mut paths: Vec<&str> = listing.split('\0').collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["gone.txt", "x/y.txt"]);
    }

    /// GetStatus reports the status document fields.
    #[tokio::test]
    async fn test_get_status_document() {
        let fx = fixture();
        let status: serde_json::Value =
            serde_json::from_str(&send(&fx, "GetStatus", "").await).unwrap();
        assert_eq!(status["RepoUrl"], "https://example.com/repo");
        assert_eq!(status["DiskLayoutVersion"], 16);
        assert_eq!(status["MountStatus"], "Ready");
        assert_eq!(status["LockStatus"], "Free");
        assert_eq!(status["BackgroundOperationCount"], 0);
    }

    /// Unknown headers answer UnknownRequest; RunPostFetchJob validates JSON.
    #[tokio::test]
    async fn test_unknown_and_post_fetch() {
        let fx = fixture();
        assert_eq!(send(&fx, "MakeCoffee", "").await, "UnknownRequest");
        assert_eq!(send(&fx, "RunPostFetchJob", "not json").await, "Failure");
        assert_eq!(
            send(&fx, "RunPostFetchJob", r#"["pack-1.idx"]"#).await,
            "Success"
        );
        assert_eq!(send(&fx, "PostIndexChanged", "").await, "Success");
    }

    /// The framed socket round-trip works end to end.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_round_trip() {
        let fx = fixture();
        let path = pipe_path_for(fx._dir.path());
        let server = IpcServer::serve(fx.router.clone(), path.clone()).unwrap();

        let response = request(&path, "GetStatus", "").await.unwrap();
        assert!(response.contains("\"MountStatus\""));

        let response = request(&path, "DownloadObject", "zzz").await.unwrap();
        assert_eq!(response, "InvalidSHA");

        server.shutdown();
        assert!(!path.exists());
    }

    /// Unmount notifies the owner exactly while Ready.
    #[tokio::test]
    async fn test_unmount_verb() {
        let fx = fixture();
        let notified = fx.router.unmount_requested.clone();
        let wait = tokio::spawn(async move { notified.notified().await });
        tokio::task::yield_now().await;
        assert_eq!(send(&fx, "Unmount", "").await, "Success");
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();

        fx.virtualizer.set_state(MountState::Unmounting);
        assert_eq!(send(&fx, "Unmount", "").await, "UnmountInProgress");
    }
}
