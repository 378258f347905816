//! Persisted run status: last run time, last error, and match count.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BounceError, Result};

/// File name of the status document inside the data directory.
pub const STATUS_FILE_NAME: &str = "status.json";

/// The only status signals kept between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStatus {
    /// End of the last successful run, in the site timezone.
    pub last_run: Option<DateTime<FixedOffset>>,
    /// Empty after a clean run.
    pub last_error: String,
    /// Unseen matching messages found by the last successful run.
    pub count: usize,
}

/// JSON status document.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(STATUS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current status; missing or unreadable documents read as the default.
    pub fn load(&self) -> RunStatus {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Unreadable status file");
                RunStatus::default()
            }),
            Err(_) => RunStatus::default(),
        }
    }

    pub fn save(&self, status: &RunStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BounceError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(status)?;
        fs::write(&self.path, json).map_err(|e| BounceError::io(&self.path, e))
    }

    /// Failed run: only the error changes.
    pub fn record_error(&self, message: &str) -> Result<()> {
        let mut status = self.load();
        status.last_error = message.to_string();
        debug!(error = message, "Recording run error");
        self.save(&status)
    }

    /// Successful run. `note` (a non-fatal store error) is kept as the last
    /// error; otherwise the error is cleared.
    pub fn record_success(
        &self,
        count: usize,
        finished: DateTime<FixedOffset>,
        note: Option<&str>,
    ) -> Result<()> {
        let status = RunStatus {
            last_run: Some(finished),
            last_error: note.unwrap_or_default().to_string(),
            count,
        };
        self.save(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00+02:00").unwrap()
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(StatusFile::in_dir(dir.path()).load(), RunStatus::default());
    }

    #[test]
    fn test_error_keeps_previous_success() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::in_dir(dir.path());
        file.record_success(4, finished(), None).unwrap();
        file.record_error("IMAP connection failed: refused").unwrap();

        let status = file.load();
        assert_eq!(status.count, 4);
        assert_eq!(status.last_run, Some(finished()));
        assert_eq!(status.last_error, "IMAP connection failed: refused");
    }

    #[test]
    fn test_success_clears_error_unless_noted() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::in_dir(dir.path());
        file.record_error("boom").unwrap();
        file.record_success(0, finished(), None).unwrap();
        assert_eq!(file.load().last_error, "");

        file.record_success(2, finished(), Some("Store error: disk full"))
            .unwrap();
        assert_eq!(file.load().last_error, "Store error: disk full");
    }

    #[test]
    fn test_garbage_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::in_dir(dir.path());
        fs::write(file.path(), "{not json").unwrap();
        assert_eq!(file.load(), RunStatus::default());
    }
}
