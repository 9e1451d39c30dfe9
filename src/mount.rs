//! The mount context: one owner for every moving part of a mounted
//! enlistment.
//!
//! Construction wires the pieces in dependency order (metadata → journal →
//! projection → cache → workers → filter) and publishes Ready only when all
//! of them stand. Unmount runs the same order backwards: flip the state,
//! drain callbacks, stop the workers, detach the filter, close the pipe.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    cache::{BlobSizes, ObjectCache},
    config::MountConfig,
    enlistment::{Enlistment, ExitCode},
    errors::GvfsError,
    http::{
        auth::{CredentialManager, GitCredentialHelper},
        requester::{ObjectRequester, RequesterOptions},
    },
    index::Projector,
    ipc::{IpcRouter, IpcServer, StatusSource, pipe_path_for},
    journal::ModifiedPathsJournal,
    lock::WorkTreeLock,
    maintenance::{MaintenanceContext, MaintenanceScheduler, MaintenanceStep},
    object::store::ObjectStore,
    trace::{HEARTBEAT_PERIOD, Heartbeat, HeartbeatSnapshot, init_mount_log},
    virtualize::{MountState, Virtualizer, filter::FilterDriver, platform::default_platform},
};

/// Why a mounted enlistment is coming down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A pipe client sent `Unmount`.
    ClientRequest,
    /// A callback surfaced a fatal error; the process must exit non-zero
    /// after the orderly teardown.
    Fatal,
}

impl ShutdownReason {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ShutdownReason::ClientRequest => ExitCode::Success,
            ShutdownReason::Fatal => ExitCode::GenericFailure,
        }
    }
}

/// Everything the caller decides before mounting.
pub struct MountOptions {
    pub enlistment_root: PathBuf,
    pub local_cache_root: PathBuf,
    /// Origin URL of the repo; the `/gvfs` endpoints hang off it.
    pub repo_url: String,
    pub git_binary: PathBuf,
}

/// A mounted enlistment. Dropping it without [`Mount::unmount`] leaves the
/// working tree intact but the pipe and workers die with the process.
pub struct Mount {
    pub enlistment: Enlistment,
    pub config: MountConfig,
    pub store: Arc<ObjectStore>,
    pub projector: Arc<Projector>,
    pub journal: Arc<ModifiedPathsJournal>,
    pub cache: ObjectCache,
    pub lock: WorkTreeLock,
    pub virtualizer: Arc<Virtualizer>,
    router: Arc<IpcRouter>,
    ipc: Option<IpcServer>,
    heartbeat: Option<Heartbeat>,
    maintenance_task: tokio::task::JoinHandle<()>,
    filter: Arc<dyn FilterDriver>,
}

impl Mount {
    /// Bring an enlistment up: load state, start workers, attach the filter,
    /// go Ready.
    pub async fn mount(
        options: MountOptions,
        filter: Arc<dyn FilterDriver>,
    ) -> Result<Mount, GvfsError> {
        let enlistment = Enlistment::open(
            options.enlistment_root.clone(),
            options.local_cache_root.clone(),
        )?;
        let log_path = init_mount_log(&enlistment.logs_dir())?;
        info!(
            enlistment = %enlistment.root().display(),
            mount_id = %enlistment.mount_id,
            log = %log_path.display(),
            "mounting"
        );

        let config = MountConfig::load(&enlistment.config_dat());
        let shared_objects = enlistment.shared_objects_dir()?;
        enlistment.write_alternates(&shared_objects)?;
        let store = Arc::new(ObjectStore::open(
            shared_objects.clone(),
            options.git_binary.clone(),
        )?);

        let journal = Arc::new(ModifiedPathsJournal::open(
            &enlistment.databases_dir().join("ModifiedPaths.dat"),
        )?);
        let sizes = BlobSizes::open(&enlistment.databases_dir().join("BlobSizes.dat"))?;

        let credentials = Arc::new(CredentialManager::new(Box::new(GitCredentialHelper::new(
            options.git_binary.clone(),
        ))));
        let requester = Arc::new(ObjectRequester::new(
            options.repo_url.clone(),
            config.cache_server_url.clone(),
            credentials,
            RequesterOptions {
                max_attempts: config.max_attempts,
                timeout: Duration::from_secs(config.timeout_seconds),
            },
        )?);
        let cache = ObjectCache::new(
            store.clone(),
            requester,
            sizes,
            Duration::from_millis(config.batch_window_ms),
        );

        let projector = Arc::new(Projector::load(enlistment.index_file())?);
        let lock = WorkTreeLock::new();
        let virtualizer = Arc::new(Virtualizer::new(
            projector.clone(),
            journal.clone(),
            cache.clone(),
            lock.clone(),
            enlistment.src_root(),
        ));

        let platform = default_platform();
        let maintenance_ctx = Arc::new(MaintenanceContext {
            store: store.clone(),
            git_binary: options.git_binary.clone(),
            git_dir: enlistment.git_dir(),
            enlistment_root: enlistment.root().to_path_buf(),
            hooks_dir: enlistment.dot_gvfs().join("hooks"),
            repack_batch_size: config.repack_batch_size.clone(),
            status_cache_path: platform.supports_status_cache().then(|| {
                options
                    .local_cache_root
                    .join("gitStatusCache")
                    .join("status.dat")
            }),
        });
        let scheduler = Arc::new(MaintenanceScheduler::with_default_steps(
            maintenance_ctx,
            enlistment.databases_dir(),
        ));
        let (adhoc_tx, maintenance_task) = scheduler.clone().spawn(Duration::from_secs(60));

        let router = Arc::new(IpcRouter::new(
            virtualizer.clone(),
            lock.clone(),
            journal.clone(),
            cache.clone(),
            projector.clone(),
            scheduler,
            adhoc_tx,
            StatusSource {
                enlistment_root: enlistment.root().display().to_string(),
                local_cache_root: options.local_cache_root.display().to_string(),
                repo_url: options.repo_url.clone(),
                cache_server: config
                    .cache_server_url
                    .clone()
                    .unwrap_or_else(|| "None".to_string()),
                disk_layout_version: enlistment.metadata.layout_version(),
            },
        ));
        #[cfg(unix)]
        let ipc = Some(IpcServer::serve(
            router.clone(),
            pipe_path_for(enlistment.root()),
        )?);
        #[cfg(not(unix))]
        let ipc = None;

        let heartbeat = {
            let cache = cache.clone();
            let journal = journal.clone();
            Heartbeat::start(HEARTBEAT_PERIOD, move || HeartbeatSnapshot {
                background_ops: cache.in_flight(),
                fetches_in_flight: cache.in_flight(),
                modified_paths: journal.len(),
            })
        };

        if let Err(e) = filter.start().await {
            virtualizer.set_state(MountState::MountFailed);
            return Err(e);
        }
        virtualizer.set_state(MountState::Ready);
        info!("mount ready");

        Ok(Mount {
            enlistment,
            config,
            store,
            projector,
            journal,
            cache,
            lock,
            virtualizer,
            router,
            ipc,
            heartbeat: Some(heartbeat),
            maintenance_task,
            filter,
        })
    }

    /// The router, for embedders that dispatch pipe frames themselves.
    pub fn router(&self) -> Arc<IpcRouter> {
        self.router.clone()
    }

    /// Block until the mount has to come down: a pipe client's `Unmount`, or
    /// a fatal error surfaced by the callback engine. The caller follows up
    /// with [`Mount::unmount`] and exits with the reason's code.
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        if self.virtualizer.mount_state() == MountState::MountFailed {
            return ShutdownReason::Fatal;
        }
        let fatal = self.virtualizer.fatal_signal();
        tokio::select! {
            _ = self.router.unmount_requested.notified() => ShutdownReason::ClientRequest,
            _ = fatal.notified() => ShutdownReason::Fatal,
        }
    }

    /// Enqueue an ad-hoc maintenance step right away (used after prefetch).
    pub async fn run_maintenance_now(
        &self,
        step: &dyn MaintenanceStep,
        force: bool,
    ) -> Result<crate::maintenance::StepOutcome, GvfsError> {
        self.router.scheduler().run_step(step, force).await
    }

    /// Orderly shutdown: terminal state, drain callbacks, stop workers,
    /// detach the filter, close the pipe, flush logs.
    pub async fn unmount(mut self) -> Result<(), GvfsError> {
        info!("unmounting");
        self.virtualizer.begin_unmount().await;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        self.maintenance_task.abort();
        if let Err(e) = self.filter.stop().await {
            warn!(error = %e, "filter detach failed");
        }
        if let Some(ipc) = self.ipc.take() {
            ipc.shutdown();
        }
        info!("unmounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        index::format::tests::build_index,
        object::ObjectKind,
        oid::ObjectId,
        virtualize::filter::NullFilterDriver,
    };

    /// Prepare an enlistment directory with a real index and a local object.
    fn seed_enlistment(dir: &std::path::Path) -> (PathBuf, PathBuf, ObjectId, Vec<u8>) {
        let root = dir.join("enlistment");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        let cache_root = dir.join("cache");

        let content = b"seeded file body".to_vec();
        let oid = ObjectId::for_object(ObjectKind::Blob, &content);
        std::fs::write(
            root.join(".git").join("index"),
            build_index(
                4,
                &[("docs/readme.md", oid, 0o100644, true, content.len() as u32)],
            ),
        )
        .unwrap();
        (root, cache_root, oid, content)
    }

    /// A full mount comes up Ready, serves callbacks from local objects, and
    /// unmounts cleanly.
    #[tokio::test]
    async fn test_mount_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (root, cache_root, oid, content) = seed_enlistment(dir.path());

        let mount = Mount::mount(
            MountOptions {
                enlistment_root: root.clone(),
                local_cache_root: cache_root,
                repo_url: "https://example.com/big-repo".into(),
                git_binary: "/bin/echo".into(),
            },
            Arc::new(NullFilterDriver),
        )
        .await
        .unwrap();
        assert_eq!(mount.virtualizer.mount_state(), MountState::Ready);

        // Seed the shared store so hydration answers without the network.
        mount
            .store
            .write_loose(&oid, ObjectKind::Blob, &content)
            .unwrap();

        let listing = mount.virtualizer.enumerate_directory("").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "docs");

        let mut sink = crate::virtualize::filter::BufferSink::default();
        let written = mount
            .virtualizer
            .get_file_stream("docs/readme.md", 0, content.len() as u64, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, content.len() as u64);
        assert_eq!(sink.bytes, content);

        // The alternates file points the repo at the shared cache.
        let alternates = std::fs::read_to_string(
            root.join(".git").join("objects").join("info").join("alternates"),
        )
        .unwrap();
        assert!(alternates.contains("gitObjects"));

        mount.unmount().await.unwrap();
    }

    /// A fatal callback failure wakes the shutdown waiter with the non-zero
    /// exit path; the orderly unmount still completes.
    #[tokio::test]
    async fn test_fatal_error_drives_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (root, cache_root, _oid, _content) = seed_enlistment(dir.path());
        let mount = Mount::mount(
            MountOptions {
                enlistment_root: root,
                local_cache_root: cache_root,
                repo_url: "https://example.com/big-repo".into(),
                git_binary: "/bin/echo".into(),
            },
            Arc::new(NullFilterDriver),
        )
        .await
        .unwrap();

        mount
            .virtualizer
            .report_failure(&GvfsError::Invariant("projection snapshot lost".into()));

        let reason = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            mount.wait_for_shutdown(),
        )
        .await
        .unwrap();
        assert_eq!(reason, ShutdownReason::Fatal);
        assert_eq!(reason.exit_code(), ExitCode::GenericFailure);
        assert_eq!(mount.virtualizer.mount_state(), MountState::MountFailed);

        mount.unmount().await.unwrap();
    }

    /// Mounting twice reuses the same enlistment identity and cache mapping.
    #[tokio::test]
    async fn test_remount_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (root, cache_root, _oid, _content) = seed_enlistment(dir.path());
        let options = || MountOptions {
            enlistment_root: root.clone(),
            local_cache_root: cache_root.clone(),
            repo_url: "https://example.com/big-repo".into(),
            git_binary: "/bin/echo".into(),
        };

        let first = Mount::mount(options(), Arc::new(NullFilterDriver))
            .await
            .unwrap();
        let enlistment_id = first.enlistment.metadata.enlistment_id().to_string();
        let mount_id = first.enlistment.mount_id;
        let objects_dir = first.enlistment.shared_objects_dir().unwrap();
        first.unmount().await.unwrap();

        let second = Mount::mount(options(), Arc::new(NullFilterDriver))
            .await
            .unwrap();
        assert_eq!(second.enlistment.metadata.enlistment_id(), enlistment_id);
        assert_ne!(second.enlistment.mount_id, mount_id);
        assert_eq!(second.enlistment.shared_objects_dir().unwrap(), objects_dir);
        second.unmount().await.unwrap();
    }
}
