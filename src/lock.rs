//! Expiring lock files.
//!
//! A lock is a file created exclusively and holding its acquisition time as a
//! Unix timestamp followed by a token unique to the holder. A lock older than
//! its time-to-live is considered abandoned and taken over. Ingestion runs and
//! writes to the record store each use one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{BounceError, Result};

/// Name of the lock guarding ingestion runs.
pub const RUN_LOCK_NAME: &str = "bouncewatch-run";

/// Delay between attempts of a blocking acquire.
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

static ACQUISITIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    ttl: Duration,
}

impl RunLock {
    /// Lock `<dir>/<name>.lock` expiring after `ttl`.
    pub fn new(dir: &Path, name: &str, ttl: Duration) -> Self {
        Self {
            path: dir.join(format!("{name}.lock")),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, or `None` while another holder's lock is still fresh.
    pub fn try_acquire(&self) -> Result<Option<RunLockGuard>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BounceError::io(parent, e))?;
        }

        if let Some(guard) = self.create()? {
            return Ok(Some(guard));
        }

        let Some(content) = self.read_content() else {
            // Released between our attempt and the read.
            return self.create();
        };
        if !self.is_stale(&content) {
            debug!(path = %self.path.display(), "Lock is held");
            return Ok(None);
        }

        // Only remove the lock judged stale, not one a competitor just took.
        if self.read_content().as_deref() == Some(content.as_str()) {
            warn!(path = %self.path.display(), "Taking over stale lock");
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BounceError::io(&self.path, e)),
            }
        }
        self.create()
    }

    /// Take the lock, waiting up to `wait` for the current holder to release it.
    pub fn acquire(&self, wait: Duration) -> Result<RunLockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if started.elapsed() >= wait {
                return Err(BounceError::Locked(self.path.display().to_string()));
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    fn create(&self) -> Result<Option<RunLockGuard>> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(BounceError::io(&self.path, e)),
        };
        let token = format!("{} {}", Utc::now().timestamp(), holder_id());
        let guard = RunLockGuard {
            path: self.path.clone(),
            token: token.clone(),
        };
        file.write_all(token.as_bytes())
            .map_err(|e| BounceError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "Lock acquired");
        Ok(Some(guard))
    }

    fn read_content(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    /// Age from the stored timestamp, or from the file's mtime when the
    /// content is unreadable.
    fn is_stale(&self, content: &str) -> bool {
        let stored = content
            .split_whitespace()
            .next()
            .and_then(|ts| ts.parse::<i64>().ok());
        let age = match stored {
            Some(ts) => Duration::from_secs(u64::try_from(Utc::now().timestamp() - ts).unwrap_or(0)),
            None => fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default(),
        };
        age > self.ttl
    }
}

/// `pid-nanos-sequence`, distinct for every acquisition on this host.
fn holder_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let seq = ACQUISITIONS.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos}-{seq}", std::process::id())
}

/// Held lock. Dropping it removes the lock file, unless another holder has
/// taken it over in the meantime.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => {}
            Ok(_) => {
                warn!(path = %self.path.display(), "Lock was taken over; leaving it");
                return;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read lock on release");
                return;
            }
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not release lock");
        } else {
            debug!(path = %self.path.display(), "Lock released");
        }
    }
}
