//! Cooperative, cross-process file lock (part of C2).
//!
//! One writer at a time across every process sharing a database path,
//! using `O_CREAT|O_EXCL` as the only portable compare-and-swap the
//! filesystem offers -- the same spirit as [`crate::store::StorageBackend::put_if_version`],
//! just at the OS layer. Grounded in the PID-liveness pattern of
//! `OpenAgentsInc-openagents`'s `agent_lock.rs` (`libc::kill(pid, 0)` to
//! probe a same-host process), generalized here with a jittered backoff
//! loop bounded by [`crate::store::StoreConfig::lock_acquire_budget`].

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::StoreConfig;

/// The kind of process holding a lock, recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// A long-lived service or daemon.
    Daemon,
    /// A one-shot CLI invocation.
    Cli,
    /// Anything else (test harnesses, embedding applications).
    Other,
}

/// The content of a held lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    /// OS process id of the holder, same-host only.
    pub pid: u32,
    /// Hostname the lock was acquired on, informational only -- liveness
    /// is never probed across hosts.
    pub host: String,
    /// What kind of process this is.
    pub process_kind: ProcessKind,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} on {}", self.pid, self.host)
    }
}

/// Returns `true` if a process with `pid` is still alive on this host.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// A cooperative lock file living alongside a database path
/// (`<db_path>.lock`).
///
/// Acquisition is advisory: every writer must go through
/// [`FileLock::acquire`] and release via [`FileLock::release`] or
/// `Drop`-free explicit call -- nothing in the filesystem stops an
/// uncooperative process from writing around it.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    process_kind: ProcessKind,
    held: std::sync::atomic::AtomicBool,
}

impl FileLock {
    /// Builds the lock for a database at `db_path` (the lock file is
    /// `db_path` with `.lock` appended).
    pub fn new(db_path: impl AsRef<Path>, process_kind: ProcessKind) -> Self {
        let mut path = db_path.as_ref().as_os_str().to_owned();
        path.push(".lock");
        Self {
            path: PathBuf::from(path),
            process_kind,
            held: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn read_holder(&self) -> Option<LockHolder> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// A lock is stale if its holder's recorded age exceeds
    /// `stale_lock_threshold` *and* (same-host only) the recorded pid is
    /// no longer alive. Both conditions are required: an old-but-alive
    /// holder (a long transaction) is not stale; a dead pid with a fresh
    /// timestamp from a different host is left alone since liveness can't
    /// be probed remotely.
    fn is_stale(&self, holder: &LockHolder, threshold: Duration) -> bool {
        let age = Utc::now().signed_duration_since(holder.acquired_at);
        let age_exceeds = age.to_std().map(|d| d > threshold).unwrap_or(true);
        age_exceeds && holder.host == local_hostname() && !pid_is_alive(holder.pid)
    }

    fn try_create(&self) -> std::io::Result<()> {
        let holder = LockHolder {
            pid: std::process::id(),
            host: local_hostname(),
            process_kind: self.process_kind,
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&holder).expect("LockHolder always serializes");
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Attempts to acquire the lock, retrying with jittered exponential
    /// backoff until `config.lock_acquire_budget` elapses.
    ///
    /// A lock file with unparseable content is treated as absent (§6
    /// "corrupt lock content is treated as absent") and is overwritten on
    /// the next attempt.
    ///
    /// # Errors
    ///
    /// [`EngineError::LockBusy`] if the budget is exhausted while another
    /// live holder keeps the lock.
    pub async fn acquire(&self, config: &StoreConfig) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + config.lock_acquire_budget;
        let mut backoff = config.lock_retry_initial_backoff;
        loop {
            match self.try_create() {
                Ok(()) => {
                    self.held.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = self.read_holder();
                    match holder {
                        Some(ref h) if self.is_stale(h, config.stale_lock_threshold) => {
                            let _ = std::fs::remove_file(&self.path);
                            continue;
                        }
                        None => {
                            // Corrupt content: treat as absent and retry immediately.
                            let _ = std::fs::remove_file(&self.path);
                            continue;
                        }
                        Some(h) => {
                            if tokio::time::Instant::now() >= deadline {
                                return Err(EngineError::LockBusy {
                                    holder: h.to_string(),
                                });
                            }
                            let jitter = Duration::from_millis(fastrand_jitter(backoff));
                            tokio::time::sleep(jitter).await;
                            backoff = (backoff * 2).min(config.lock_retry_max_backoff);
                        }
                    }
                }
                Err(e) => {
                    return Err(EngineError::Fatal(crate::error::StoreIoError::Io(
                        e.to_string(),
                    )))
                }
            }
        }
    }

    /// Releases the lock if this process holds it. No-op otherwise.
    pub fn release(&self) {
        if self
            .held
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Reports the current holder without attempting acquisition, for the
    /// `lock_status()` administration surface.
    pub fn status(&self) -> Option<LockHolder> {
        self.read_holder()
    }

    /// Unconditionally deletes the lock file, regardless of who holds it
    /// (§6 "Lock administration": `force_unlock`).
    pub fn force_unlock(&self) {
        self.held.store(false, std::sync::atomic::Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// A small deterministic jitter around `base`, avoiding a dependency on a
/// dedicated RNG crate for what is just backoff smoothing.
fn fastrand_jitter(base: Duration) -> u64 {
    let nanos = Utc::now().timestamp_subsec_nanos() as u64;
    let base_ms = base.as_millis() as u64;
    let spread = (base_ms / 4).max(1);
    base_ms + (nanos % spread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn acquire_then_release_allows_reacquisition() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let lock = FileLock::new(&db_path, ProcessKind::Cli);
        lock.acquire(&StoreConfig::default()).await.unwrap();
        assert!(lock.status().is_some());
        lock.release();
        assert!(lock.status().is_none());
        lock.acquire(&StoreConfig::default()).await.unwrap();
        lock.release();
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_first_holds() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let first = FileLock::new(&db_path, ProcessKind::Daemon);
        first.acquire(&StoreConfig::default()).await.unwrap();

        let second = FileLock::new(&db_path, ProcessKind::Cli);
        let config = StoreConfig {
            lock_acquire_budget: Duration::from_millis(80),
            lock_retry_initial_backoff: Duration::from_millis(10),
            lock_retry_max_backoff: Duration::from_millis(20),
            ..StoreConfig::default()
        };
        let err = second.acquire(&config).await.unwrap_err();
        assert!(matches!(err, EngineError::LockBusy { .. }));
        first.release();
    }

    #[tokio::test]
    async fn corrupt_lock_content_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let lock_path = {
            let mut p = db_path.as_os_str().to_owned();
            p.push(".lock");
            PathBuf::from(p)
        };
        std::fs::write(&lock_path, b"not json").unwrap();
        let lock = FileLock::new(&db_path, ProcessKind::Cli);
        lock.acquire(&StoreConfig::default()).await.unwrap();
        lock.release();
    }

    #[test]
    fn stale_detection_requires_both_age_and_dead_pid() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let lock = FileLock::new(&db_path, ProcessKind::Cli);
        let fresh_but_dead = LockHolder {
            pid: 999_999,
            host: local_hostname(),
            process_kind: ProcessKind::Cli,
            acquired_at: Utc::now(),
        };
        assert!(!lock.is_stale(&fresh_but_dead, Duration::from_secs(30)));

        let old_and_dead = LockHolder {
            pid: 999_999,
            host: local_hostname(),
            process_kind: ProcessKind::Cli,
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
        };
        assert!(lock.is_stale(&old_and_dead, Duration::from_secs(30)));
    }
}
