//! Object-cache maintenance.
//!
//! A single worker runs named steps strictly serially. Each step carries a
//! minimum interval enforced through a `<step>.time` gate file of Unix-epoch
//! seconds, and steps that mutate the object directory defer while a live
//! `git` process is working inside the enlistment. `force_run` bypasses both
//! gates for tests and explicit operator requests.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{errors::GvfsError, gitproc::GitCommand, object::store::ObjectStore};

/// Shared inputs for every step.
pub struct MaintenanceContext {
    pub store: Arc<ObjectStore>,
    pub git_binary: PathBuf,
    pub git_dir: PathBuf,
    pub enlistment_root: PathBuf,
    pub hooks_dir: PathBuf,
    pub repack_batch_size: String,
    /// Set when the platform supports the serialized status cache.
    pub status_cache_path: Option<PathBuf>,
}

impl MaintenanceContext {
    fn git(&self, summary: &str) -> GitCommand {
        GitCommand::new(&self.git_binary, summary).git_dir(&self.git_dir)
    }

    fn object_dir_arg(&self) -> String {
        format!("--object-dir={}", self.store.loose().root().display())
    }
}

/// Why a step did not run this time around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ran,
    /// The minimum interval since the last successful run has not elapsed.
    SkippedInterval,
    /// A live `git` process is working in this enlistment.
    SkippedLiveGit,
    /// The step decided there was nothing to do.
    SkippedNothingToDo,
}

#[async_trait]
pub trait MaintenanceStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn min_interval(&self) -> Duration;

    /// Steps that rewrite packs defer while git is live in the enlistment.
    fn mutates_object_store(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &MaintenanceContext) -> Result<StepOutcome, GvfsError>;
}

/// Pack dir accounting for the telemetry event around pack maintenance.
fn pack_stats(pack_dir: &Path) -> (usize, u64) {
    let mut count = 0usize;
    let mut bytes = 0u64;
    if let Ok(entries) = fs::read_dir(pack_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "pack") {
                count += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }
    (count, bytes)
}

/// Expire + repack through the multi-pack-index, with a stale-idx sweep in
/// between for files the expire could not unlink.
pub struct PackfileMaintenanceStep;

#[async_trait]
impl MaintenanceStep for PackfileMaintenanceStep {
    fn name(&self) -> &'static str {
        "PackfileMaintenance"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    async fn run(&self, ctx: &MaintenanceContext) -> Result<StepOutcome, GvfsError> {
        if !ctx.store.owns_packs() {
            // No `.keep` marker means no packs of ours to maintain.
            return Ok(StepOutcome::SkippedNothingToDo);
        }
        let (packs_before, bytes_before) = pack_stats(ctx.store.pack_dir());

        ctx.git("multi-pack-index expire")
            .arg("multi-pack-index")
            .arg("expire")
            .arg(ctx.object_dir_arg())
            .output()
            .await?;

        let stale = ctx.store.clean_stale_idx_files()?;
        let (packs_after_expire, _) = pack_stats(ctx.store.pack_dir());

        ctx.git("multi-pack-index repack")
            .arg("multi-pack-index")
            .arg("repack")
            .arg(ctx.object_dir_arg())
            .arg(format!("--batch-size={}", ctx.repack_batch_size))
            .output()
            .await?;
        ctx.store.refresh_packs();

        let (packs_after, bytes_after) = pack_stats(ctx.store.pack_dir());
        info!(
            packs_before,
            bytes_before,
            packs_after_expire,
            stale_idx_removed = stale.len(),
            packs_after,
            bytes_after,
            "packfile maintenance finished"
        );
        Ok(StepOutcome::Ran)
    }
}

/// Pack loose objects into a fresh pack and prune the packed originals.
pub struct LooseObjectStep;

#[async_trait]
impl MaintenanceStep for LooseObjectStep {
    fn name(&self) -> &'static str {
        "LooseObjects"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    async fn run(&self, ctx: &MaintenanceContext) -> Result<StepOutcome, GvfsError> {
        let loose = ctx.store.loose().iter_oids()?;
        if loose.is_empty() {
            return Ok(StepOutcome::SkippedNothingToDo);
        }
        let mut stdin = String::with_capacity(loose.len() * 41);
        for oid in &loose {
            stdin.push_str(&oid.to_string());
            stdin.push('\n');
        }
        let prefix = ctx.store.pack_dir().join("pack");
        let output = ctx
            .git("pack loose objects")
            .arg("pack-objects")
            .arg("-q")
            .arg(&prefix)
            .stdin_bytes(stdin.into_bytes())
            .output()
            .await?;
        let pack_hash = output.stdout_str().trim().to_string();
        if pack_hash.is_empty() {
            return Err(GvfsError::CustomError(
                "pack-objects produced no pack name".into(),
            ));
        }
        let keep = ctx.store.pack_dir().join(format!("pack-{pack_hash}.keep"));
        fs::write(&keep, b"gvfs\n")?;
        ctx.store.refresh_packs();

        for oid in &loose {
            ctx.store.loose().remove(oid)?;
        }
        info!(objects = loose.len(), pack = %pack_hash, "packed loose objects");
        Ok(StepOutcome::Ran)
    }
}

/// Append to the commit-graph chain covering the referenced packs.
pub struct CommitGraphStep;

#[async_trait]
impl MaintenanceStep for CommitGraphStep {
    fn name(&self) -> &'static str {
        "CommitGraph"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    async fn run(&self, ctx: &MaintenanceContext) -> Result<StepOutcome, GvfsError> {
        ctx.git("commit-graph write")
            .arg("commit-graph")
            .arg("write")
            .arg(ctx.object_dir_arg())
            .arg("--split")
            .arg("--reachable")
            .output()
            .await?;
        Ok(StepOutcome::Ran)
    }
}

/// After a prefetch: fold new packs into the multi-pack-index and extend the
/// commit-graph. Enqueued ad hoc, no time gate.
pub struct PostFetchStep;

#[async_trait]
impl MaintenanceStep for PostFetchStep {
    fn name(&self) -> &'static str {
        "PostFetch"
    }

    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    async fn run(&self, ctx: &MaintenanceContext) -> Result<StepOutcome, GvfsError> {
        ctx.git("multi-pack-index write")
            .arg("multi-pack-index")
            .arg("write")
            .arg(ctx.object_dir_arg())
            .output()
            .await?;
        ctx.store.refresh_packs();
        ctx.git("commit-graph write")
            .arg("commit-graph")
            .arg("write")
            .arg(ctx.object_dir_arg())
            .arg("--split")
            .arg("--reachable")
            .output()
            .await?;
        Ok(StepOutcome::Ran)
    }
}

/// Re-apply the Git config keys virtualization depends on.
pub struct ConfigStep;

impl ConfigStep {
    /// The required table; values that depend on the enlistment are resolved
    /// at run time.
    fn required(ctx: &MaintenanceContext) -> Vec<(String, String)> {
        let mut keys = vec![
            ("core.commitGraph".to_string(), "true".to_string()),
            ("core.multiPackIndex".to_string(), "true".to_string()),
            ("core.fscache".to_string(), "true".to_string()),
            ("core.autocrlf".to_string(), "false".to_string()),
            ("core.safecrlf".to_string(), "false".to_string()),
            ("gc.auto".to_string(), "0".to_string()),
            ("receive.autogc".to_string(), "false".to_string()),
            ("diff.autoRefreshIndex".to_string(), "false".to_string()),
            ("index.version".to_string(), "4".to_string()),
            ("index.threads".to_string(), "true".to_string()),
            ("credential.validate".to_string(), "false".to_string()),
            ("credential.useHttpPath".to_string(), "true".to_string()),
            ("pack.useBitmaps".to_string(), "false".to_string()),
            ("repack.writeBitmaps".to_string(), "false".to_string()),
            (
                "core.virtualFilesystem".to_string(),
                ctx.hooks_dir.join("virtual-filesystem").display().to_string(),
            ),
            (
                "core.hooksPath".to_string(),
                ctx.hooks_dir.display().to_string(),
            ),
        ];
        if let Some(status_cache) = &ctx.status_cache_path {
            keys.push((
                "status.deserializePath".to_string(),
                status_cache.display().to_string(),
            ));
        }
        keys
    }
}

#[async_trait]
impl MaintenanceStep for ConfigStep {
    fn name(&self) -> &'static str {
        "Config"
    }

    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn mutates_object_store(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &MaintenanceContext) -> Result<StepOutcome, GvfsError> {
        for (key, value) in Self::required(ctx) {
            ctx.git("apply required config")
                .arg("config")
                .arg("--local")
                .arg(&key)
                .arg(&value)
                .output()
                .await?;
        }
        Ok(StepOutcome::Ran)
    }
}

/// Pids of live `git` processes whose working directory is inside `root`.
pub fn live_git_pids(root: &Path) -> Vec<u32> {
    let mut pids = Vec::new();
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = fs::read_dir("/proc") else {
            return pids;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let comm = fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
            if comm.trim() != "git" {
                continue;
            }
            let Ok(cwd) = fs::read_link(entry.path().join("cwd")) else {
                continue;
            };
            if cwd.starts_with(root) {
                pids.push(pid);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = root;
    }
    pids
}

/// The serial scheduler.
pub struct MaintenanceScheduler {
    ctx: Arc<MaintenanceContext>,
    steps: Vec<Arc<dyn MaintenanceStep>>,
    /// Directory holding the `<step>.time` gate files.
    time_dir: PathBuf,
}

impl MaintenanceScheduler {
    /// The built-in step set in priority order.
    pub fn with_default_steps(ctx: Arc<MaintenanceContext>, time_dir: PathBuf) -> Self {
        Self {
            ctx,
            steps: vec![
                Arc::new(ConfigStep),
                Arc::new(PackfileMaintenanceStep),
                Arc::new(LooseObjectStep),
                Arc::new(CommitGraphStep),
            ],
            time_dir,
        }
    }

    pub fn new(
        ctx: Arc<MaintenanceContext>,
        steps: Vec<Arc<dyn MaintenanceStep>>,
        time_dir: PathBuf,
    ) -> Self {
        Self { ctx, steps, time_dir }
    }

    fn time_file(&self, step: &str) -> PathBuf {
        self.time_dir.join(format!("{step}.time"))
    }

    /// Epoch seconds of the last successful run, if any.
    pub fn last_run(&self, step: &str) -> Option<i64> {
        fs::read_to_string(self.time_file(step))
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
    }

    fn record_run(&self, step: &str) -> Result<(), GvfsError> {
        fs::create_dir_all(&self.time_dir)?;
        fs::write(
            self.time_file(step),
            format!("{}\n", chrono::Utc::now().timestamp()),
        )?;
        Ok(())
    }

    /// Run one step through both gates. `force` bypasses the time gate and
    /// the live-git gate.
    pub async fn run_step(
        &self,
        step: &dyn MaintenanceStep,
        force: bool,
    ) -> Result<StepOutcome, GvfsError> {
        if !force {
            if let Some(last) = self.last_run(step.name()) {
                let elapsed = chrono::Utc::now().timestamp().saturating_sub(last);
                if (elapsed as u64) < step.min_interval().as_secs() {
                    warn!(
                        step = step.name(),
                        elapsed_secs = elapsed,
                        "skipping step: interval not elapsed"
                    );
                    return Ok(StepOutcome::SkippedInterval);
                }
            }
            if step.mutates_object_store() {
                let pids = live_git_pids(&self.ctx.enlistment_root);
                if !pids.is_empty() {
                    warn!(step = step.name(), ?pids, "deferring step: git is running");
                    return Ok(StepOutcome::SkippedLiveGit);
                }
            }
        }

        info!(step = step.name(), force, "running maintenance step");
        let outcome = step.run(&self.ctx).await?;
        if outcome == StepOutcome::Ran {
            self.record_run(step.name())?;
        }
        Ok(outcome)
    }

    /// Run a step by name (the pipe router's PostFetch path). PostFetch is
    /// ad hoc only, so it resolves here without joining the periodic sweep.
    pub async fn run_step_named(
        &self,
        name: &str,
        force: bool,
    ) -> Result<StepOutcome, GvfsError> {
        if name == "PostFetch" {
            return self.run_step(&PostFetchStep, force).await;
        }
        match self.steps.iter().find(|step| step.name() == name) {
            Some(step) => self.run_step(step.as_ref(), force).await,
            None => Err(GvfsError::InvalidRequest(format!(
                "unknown maintenance step {name}"
            ))),
        }
    }

    /// The worker loop: drain ad-hoc requests, then sweep due steps in
    /// priority order, one at a time.
    pub fn spawn(
        self: Arc<Self>,
        poll_period: Duration,
    ) -> (mpsc::UnboundedSender<Arc<dyn MaintenanceStep>>, tokio::task::JoinHandle<()>) {
        let (adhoc_tx, mut adhoc_rx) = mpsc::unbounded_channel::<Arc<dyn MaintenanceStep>>();
        let scheduler = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    request = adhoc_rx.recv() => {
                        match request {
                            Some(step) => {
                                // Steps log and continue, whatever the class.
                                if let Err(e) = scheduler.run_step(step.as_ref(), false).await {
                                    warn!(step = step.name(), class = ?e.class(), error = %e, "maintenance step failed");
                                }
                            }
                            // All senders gone: the mount is shutting down.
                            None => return,
                        }
                    }
                    _ = ticker.tick() => {
                        for step in scheduler.steps.clone() {
                            if let Err(e) = scheduler.run_step(step.as_ref(), false).await {
                                warn!(step = step.name(), class = ?e.class(), error = %e, "maintenance step failed");
                            }
                        }
                    }
                }
            }
        });
        (adhoc_tx, task)
    }
}
