//! Tracing setup and the mount heartbeat.
//!
//! Each mount session writes structured events to its own log file under
//! `.gvfs/logs/`. The heartbeat task wakes on a fixed period and emits the
//! aggregate counters an operator needs when a mount misbehaves: queue
//! depth, fetches in flight, journal size.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;

use crate::errors::GvfsError;

/// How often the heartbeat emits counters.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);

/// Initialize the process-wide subscriber writing to a fresh per-mount log
/// file. Returns the log path; a second call (tests, embedders with their
/// own subscriber) leaves the existing subscriber in place.
pub fn init_mount_log(logs_dir: &Path) -> Result<PathBuf, GvfsError> {
    std::fs::create_dir_all(logs_dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = logs_dir.join(format!("mount_{stamp}.log"));
    let file = File::create(&path)?;
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .with_max_level(tracing::Level::DEBUG)
        .finish()
        .try_init();
    Ok(path)
}

/// One heartbeat sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSnapshot {
    /// Queued background operations (open fetch jobs).
    pub background_ops: usize,
    /// Object downloads currently in flight.
    pub fetches_in_flight: usize,
    /// Distinct paths in the modified-paths journal.
    pub modified_paths: usize,
}

/// Periodic counter emitter; stops when the handle drops.
pub struct Heartbeat {
    task: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    /// Start emitting a snapshot every `period`.
    pub fn start<F>(period: Duration, sample: F) -> Heartbeat
    where
        F: Fn() -> HeartbeatSnapshot + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so counters settle.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = sample();
                info!(
                    background_ops = snapshot.background_ops,
                    fetches_in_flight = snapshot.fetches_in_flight,
                    modified_paths = snapshot.modified_paths,
                    "heartbeat"
                );
            }
        });
        Heartbeat { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}
