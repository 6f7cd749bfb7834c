//! Cross-process mutual exclusion via an exclusively-created marker file.
//!
//! [`LockManager::acquire`] either creates `pipeline.lock` or fails at once
//! with [`MarketBriefError::LockHeld`]. The returned [`LockGuard`] removes the
//! marker on [`LockGuard::release`] or when dropped.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use marketbrief_shared::{MarketBriefError, Result, date_key};

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: String,
    pub pid: u32,
    pub date: String,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} (pid {}, date {}, since {})",
            self.run_id,
            self.pid,
            self.date,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// What is currently on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    /// `None` when the marker exists but cannot be parsed.
    pub record: Option<LockRecord>,
    pub age: Duration,
    pub stale: bool,
}

impl LockStatus {
    fn holder(&self) -> String {
        match &self.record {
            Some(record) => record.to_string(),
            None => "unknown holder (unreadable lock record)".to_string(),
        }
    }
}

/// Result of an unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unlock {
    NotLocked,
    Removed(LockStatus),
    /// The lock is younger than the stale threshold and was kept.
    Kept(LockStatus),
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock for `run_id`, or fail immediately if it is held.
    pub fn acquire(&self, run_id: &str, date: NaiveDate) -> Result<LockGuard> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| MarketBriefError::io(dir, e))?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = match self.status() {
                    Ok(Some(status)) => status.holder(),
                    _ => "unknown holder".to_string(),
                };
                return Err(MarketBriefError::LockHeld {
                    path: self.path.clone(),
                    holder,
                });
            }
            Err(e) => return Err(MarketBriefError::io(&self.path, e)),
        };

        let record = LockRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            date: date_key(date),
            acquired_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|e| MarketBriefError::validation(format!("lock serialization failed: {e}")))?;

        // The marker exists from here on; the guard owns its removal.
        let guard = LockGuard {
            path: self.path.clone(),
            run_id: run_id.to_string(),
            released: false,
        };
        file.write_all(&payload)
            .and_then(|()| file.sync_all())
            .map_err(|e| MarketBriefError::io(&self.path, e))?;

        info!(path = %self.path.display(), run_id, "acquired pipeline lock");
        Ok(guard)
    }

    /// Inspect the marker without touching it.
    pub fn status(&self) -> Result<Option<LockStatus>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MarketBriefError::io(&self.path, e)),
        };

        let record: Option<LockRecord> = serde_json::from_str(&content).ok();
        let age = match &record {
            Some(r) => (Utc::now() - r.acquired_at).to_std().unwrap_or(Duration::ZERO),
            None => std::fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO),
        };

        Ok(Some(LockStatus {
            record,
            age,
            stale: age >= self.stale_after,
        }))
    }

    /// Remove the marker only if it is older than the stale threshold.
    pub fn clear_stale(&self) -> Result<Unlock> {
        match self.status()? {
            None => Ok(Unlock::NotLocked),
            Some(status) if status.stale => {
                self.remove()?;
                warn!(holder = %status.holder(), age_secs = status.age.as_secs(), "removed stale pipeline lock");
                Ok(Unlock::Removed(status))
            }
            Some(status) => Ok(Unlock::Kept(status)),
        }
    }

    /// Remove the marker regardless of age.
    pub fn force_clear(&self) -> Result<Unlock> {
        match self.status()? {
            None => Ok(Unlock::NotLocked),
            Some(status) => {
                self.remove()?;
                warn!(holder = %status.holder(), "force-removed pipeline lock");
                Ok(Unlock::Removed(status))
            }
        }
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MarketBriefError::io(&self.path, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Held lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    run_id: String,
    released: bool,
}

impl LockGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Remove the marker if it still belongs to this run.
    ///
    /// Returns `true` when a marker was removed. Calling again is a no-op.
    pub fn release(&mut self) -> Result<bool> {
        if self.released {
            return Ok(false);
        }
        self.released = true;

        let owned = match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str::<LockRecord>(&content)
                .map(|r| r.run_id == self.run_id)
                // Partially written by us: still ours.
                .unwrap_or(true),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(MarketBriefError::io(&self.path, e)),
        };
        if !owned {
            warn!(path = %self.path.display(), run_id = %self.run_id, "lock now belongs to another run, leaving it");
            return Ok(false);
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), run_id = %self.run_id, "released pipeline lock");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MarketBriefError::io(&self.path, e)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), error = %e, "failed to release pipeline lock");
        }
    }
}
