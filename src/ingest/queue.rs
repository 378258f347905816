//! Persisted schedule of per-UID parse jobs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BounceError, Result};

/// File name of the queue document inside the data directory.
pub const QUEUE_FILE_NAME: &str = "jobs.json";

/// Last second of year 9999, the latest due time a job is given.
const LATEST_DUE_SECS: i64 = 253_402_300_799;

/// Due time of the `nth` job (1-based) of a batch started at `start`, jobs
/// `step_secs` apart. Saturates at the latest due time instead of overflowing.
pub fn due_at(start: DateTime<Utc>, step_secs: u64, nth: usize) -> DateTime<Utc> {
    let latest = DateTime::from_timestamp(LATEST_DUE_SECS, 0).unwrap_or(start);
    let due = i64::try_from(step_secs)
        .ok()
        .zip(i64::try_from(nth).ok())
        .and_then(|(step, n)| step.checked_mul(n))
        .and_then(TimeDelta::try_seconds)
        .and_then(|offset| start.checked_add_signed(offset));
    match due {
        Some(due) if due <= latest => due,
        _ => latest,
    }
}

/// One scheduled parse of `uid` in `mailbox`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseJob {
    pub uid: u32,
    pub mailbox: String,
    pub due_at: DateTime<Utc>,
}

/// Pending parse jobs, loaded from and saved to a JSON file.
#[derive(Debug, Clone)]
pub struct JobQueue {
    path: PathBuf,
    jobs: Vec<ParseJob>,
}

impl JobQueue {
    /// Load the queue at `path`; a missing file is an empty queue.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(BounceError::io(&path, e)),
        };
        Ok(Self { path, jobs })
    }

    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        Self::open(data_dir.join(QUEUE_FILE_NAME))
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BounceError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&self.jobs)?;
        fs::write(&self.path, json).map_err(|e| BounceError::io(&self.path, e))
    }

    pub fn is_scheduled(&self, uid: u32, mailbox: &str) -> bool {
        self.jobs
            .iter()
            .any(|j| j.uid == uid && j.mailbox == mailbox)
    }

    /// Add `job` unless the same uid and mailbox is already pending.
    pub fn schedule(&mut self, job: ParseJob) -> bool {
        if self.is_scheduled(job.uid, &job.mailbox) {
            return false;
        }
        debug!(uid = job.uid, mailbox = %job.mailbox, due_at = %job.due_at, "Parse job scheduled");
        self.jobs.push(job);
        true
    }

    /// Remove and return every job due at `now`, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<ParseJob> {
        let (mut due, pending): (Vec<ParseJob>, Vec<ParseJob>) =
            self.jobs.drain(..).partition(|j| j.due_at <= now);
        self.jobs = pending;
        due.sort_by_key(|j| j.due_at);
        due
    }

    /// Due time of the earliest pending job.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.jobs.iter().map(|j| j.due_at).min()
    }

    pub fn pending(&self) -> &[ParseJob] {
        &self.jobs
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}
