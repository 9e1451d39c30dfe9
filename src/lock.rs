//! Cross-process lock over the working tree and index.
//!
//! External `git` invocations request the lock through the pipe router
//! before mutating the working tree; the engine itself takes an internal
//! guard around its own mutations (index rebuilds, placeholder updates). At
//! most one writer is observable at any instant: one external holder, or any
//! number of cooperating internal guards, never both. Releasing an external
//! lock queues deferred actions the callback surface drains (an external
//! `git checkout` means the projection must be re-read).

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::errors::GvfsError;

/// Identity and intent of an external lock requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockData {
    pub pid: u32,
    /// The parsed command line of the requester, for holder reporting.
    pub command: String,
    pub is_elevated: bool,
    /// Probe only: report availability without taking the lock.
    pub check_availability_only: bool,
}

impl LockData {
    /// Parse the pipe body form: `pid\0is_elevated\0check_only\0command`.
    pub fn from_body(body: &str) -> Result<LockData, GvfsError> {
        let mut fields = body.splitn(4, '\0');
        let pid = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| GvfsError::InvalidRequest("lock data missing pid".into()))?;
        let is_elevated = fields.next() == Some("true");
        let check_availability_only = fields.next() == Some("true");
        let command = fields
            .next()
            .ok_or_else(|| GvfsError::InvalidRequest("lock data missing command".into()))?
            .to_string();
        Ok(LockData {
            pid,
            command,
            is_elevated,
            check_availability_only,
        })
    }

    /// Serialize to the pipe body form.
    pub fn to_body(&self) -> String {
        format!(
            "{}\0{}\0{}\0{}",
            self.pid, self.is_elevated, self.check_availability_only, self.command
        )
    }
}

/// Outcome of an external acquire request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquireResult {
    Accepted,
    /// The engine holds an implicit write (index rebuild, placeholder
    /// update); the requester should retry.
    DeniedByEngine,
    /// Another external process holds the lock.
    DeniedByExternal { holder: String },
    /// Availability probe result; the lock was not taken.
    Availability { available: bool },
}

/// Work queued for the callback surface after an external holder releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    /// Re-read the index; an external command may have rewritten it.
    RefreshProjection,
}

#[derive(Default)]
struct LockState {
    external_holder: Option<LockData>,
    internal_count: usize,
    deferred: Vec<DeferredAction>,
}

/// The lock itself; cheap to clone and share.
#[derive(Clone, Default)]
pub struct WorkTreeLock {
    state: Arc<Mutex<LockState>>,
}

/// RAII guard for the engine's own write sections.
pub struct InternalLockGuard {
    state: Arc<Mutex<LockState>>,
}

impl Drop for InternalLockGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("lock state poisoned");
        state.internal_count -= 1;
    }
}

impl WorkTreeLock {
    pub fn new() -> WorkTreeLock {
        WorkTreeLock::default()
    }

    /// Handle an external acquire (or availability probe).
    pub fn try_acquire(&self, data: LockData) -> LockAcquireResult {
        let mut state = self.state.lock().expect("lock state poisoned");
        let available = state.external_holder.is_none() && state.internal_count == 0;
        if data.check_availability_only {
            return LockAcquireResult::Availability { available };
        }
        if state.internal_count > 0 {
            debug!(pid = data.pid, "lock denied: engine holds an internal write");
            return LockAcquireResult::DeniedByEngine;
        }
        if let Some(holder) = &state.external_holder {
            debug!(pid = data.pid, holder = %holder.command, "lock denied: already held");
            return LockAcquireResult::DeniedByExternal {
                holder: holder.command.clone(),
            };
        }
        info!(pid = data.pid, command = %data.command, "external lock acquired");
        state.external_holder = Some(data);
        LockAcquireResult::Accepted
    }

    /// Release by the holding pid. On success the deferred queue gains a
    /// projection refresh for the callback surface to drain.
    pub fn release(&self, pid: u32) -> bool {
        let mut state = self.state.lock().expect("lock state poisoned");
        match &state.external_holder {
            Some(holder) if holder.pid == pid => {
                info!(pid, "external lock released");
                state.external_holder = None;
                state.deferred.push(DeferredAction::RefreshProjection);
                true
            }
            _ => false,
        }
    }

    /// The engine's own write guard; `None` while an external process holds
    /// the lock.
    pub fn try_acquire_internal(&self) -> Option<InternalLockGuard> {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.external_holder.is_some() {
            return None;
        }
        state.internal_count += 1;
        Some(InternalLockGuard {
            state: self.state.clone(),
        })
    }

    /// The current external holder, for status reporting.
    pub fn holder(&self) -> Option<LockData> {
        self.state
            .lock()
            .expect("lock state poisoned")
            .external_holder
            .clone()
    }

    /// Take everything queued by releases since the last drain.
    pub fn drain_deferred(&self) -> Vec<DeferredAction> {
        std::mem::take(&mut self.state.lock().expect("lock state poisoned").deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pid: u32) -> LockData {
        LockData {
            pid,
            command: format!("git status (pid {pid})"),
            is_elevated: false,
            check_availability_only: false,
        }
    }

    /// Under concurrent acquires exactly one caller observes Accepted.
    #[test]
    fn test_single_winner() {
        let lock = WorkTreeLock::new();
        let mut handles = Vec::new();
        for pid in 1..=16 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || lock.try_acquire(data(pid))));
        }
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == LockAcquireResult::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert!(lock.holder().is_some());
    }

    /// Second acquire is denied with the holder's command; release frees it.
    #[test]
    fn test_deny_and_release() {
        let lock = WorkTreeLock::new();
        assert_eq!(lock.try_acquire(data(100)), LockAcquireResult::Accepted);
        match lock.try_acquire(data(200)) {
            LockAcquireResult::DeniedByExternal { holder } => {
                assert!(holder.contains("100"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        // Only the holder can release.
        assert!(!lock.release(200));
        assert!(lock.release(100));
        assert_eq!(lock.try_acquire(data(200)), LockAcquireResult::Accepted);
    }

    /// The internal guard blocks external acquires and vice versa.
    #[test]
    fn test_internal_exclusion() {
        let lock = WorkTreeLock::new();
        let guard = lock.try_acquire_internal().unwrap();
        assert_eq!(lock.try_acquire(data(1)), LockAcquireResult::DeniedByEngine);
        drop(guard);
        assert_eq!(lock.try_acquire(data(1)), LockAcquireResult::Accepted);
        assert!(lock.try_acquire_internal().is_none());
    }

    /// Availability probes never take the lock.
    #[test]
    fn test_availability_probe() {
        let lock = WorkTreeLock::new();
        let mut probe = data(5);
        probe.check_availability_only = true;
        assert_eq!(
            lock.try_acquire(probe.clone()),
            LockAcquireResult::Availability { available: true }
        );
        assert!(lock.holder().is_none());

        lock.try_acquire(data(6));
        assert_eq!(
            lock.try_acquire(probe),
            LockAcquireResult::Availability { available: false }
        );
    }

    /// Release queues a projection refresh for the callback surface.
    #[test]
    fn test_deferred_actions() {
        let lock = WorkTreeLock::new();
        lock.try_acquire(data(9));
        assert!(lock.drain_deferred().is_empty());
        lock.release(9);
        assert_eq!(
            lock.drain_deferred(),
            vec![DeferredAction::RefreshProjection]
        );
        assert!(lock.drain_deferred().is_empty());
    }

    /// Lock data round-trips through the pipe body form.
    #[test]
    fn test_body_round_trip() {
        let original = LockData {
            pid: 4242,
            command: "git checkout feature/x".into(),
            is_elevated: true,
            check_availability_only: false,
        };
        let parsed = LockData::from_body(&original.to_body()).unwrap();
        assert_eq!(parsed, original);

        assert!(LockData::from_body("not-a-pid\0x").is_err());
        assert!(LockData::from_body("1234").is_err());
    }
}
