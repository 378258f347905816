//! File-backed bounce store.
//!
//! Every operation reloads the table from disk and writes it back whole, so
//! separate runs and jobs sharing the file see each other's rows. Writers
//! hold the store's lock file from load to rename; readers need no lock since
//! the rename replaces the file atomically.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{BounceError, Result};
use crate::lock::RunLock;
use crate::model::bounce::{BounceOverview, BounceRecord, DsnFields};
use crate::store::format::{StoreHeader, HEADER_SIZE};
use crate::store::{BounceStore, MemoryStore};

/// File name of the store inside the data directory.
pub const STORE_FILE_NAME: &str = "bounces.store";

/// A write lock older than this belongs to a crashed writer.
const WRITE_LOCK_TTL: Duration = Duration::from_secs(60);

/// How long a writer waits for another one to finish.
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`, checking an existing file's header and rows.
    ///
    /// A missing file is an empty store; it is created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        let table = store.load()?;
        debug!(path = %store.path.display(), count = table.len(), "Store opened");
        Ok(store)
    }

    /// Store file inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Result<Self> {
        Self::open(data_dir.join(STORE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> BounceError {
        BounceError::CorruptStore {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn load(&self) -> Result<MemoryStore> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MemoryStore::new()),
            Err(e) => return Err(BounceError::io(&self.path, e)),
        };

        if data.len() < HEADER_SIZE {
            return Err(self.corrupt("File too small"));
        }

        let header: StoreHeader = bincode::deserialize(&data[..HEADER_SIZE])
            .map_err(|e| self.corrupt(format!("Header deserialization failed: {e}")))?;
        header.validate().map_err(|reason| self.corrupt(reason))?;

        let records: Vec<BounceRecord> = bincode::deserialize(&data[HEADER_SIZE..])
            .map_err(|e| self.corrupt(format!("Record deserialization failed: {e}")))?;

        if records.len() as u64 != header.record_count {
            return Err(self.corrupt(format!(
                "Record count mismatch: header says {}, found {}",
                header.record_count,
                records.len()
            )));
        }

        Ok(MemoryStore::from_parts(records, header.next_id))
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Lock file serializing writers of this store.
    fn write_lock(&self) -> RunLock {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STORE_FILE_NAME.to_string());
        RunLock::new(self.parent_dir(), &name, WRITE_LOCK_TTL)
    }

    /// Write the table to a fresh temporary file and rename it over the store.
    fn save(&self, table: &MemoryStore) -> Result<()> {
        let header = StoreHeader::new(table.len() as u64, table.next_id());
        let header_bytes = header.to_bytes()?;
        let record_bytes = bincode::serialize(table.rows())?;

        let parent = self.parent_dir();
        fs::create_dir_all(parent).map_err(|e| BounceError::io(parent, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| BounceError::io(parent, e))?;
        tmp.write_all(&header_bytes)
            .map_err(|e| BounceError::io(tmp.path(), e))?;
        tmp.write_all(&record_bytes)
            .map_err(|e| BounceError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| BounceError::io(tmp.path(), e))?;

        tmp.persist(&self.path)
            .map_err(|e| BounceError::io(&self.path, e.error))?;
        Ok(())
    }

    /// Under the write lock: reload, apply `f`, and write the table back.
    fn modify<T>(&mut self, f: impl FnOnce(&mut MemoryStore) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock().acquire(WRITE_LOCK_WAIT)?;
        let mut table = self.load()?;
        let result = f(&mut table)?;
        self.save(&table)?;
        Ok(result)
    }
}

impl BounceStore for FileStore {
    fn upsert(&mut self, overview: &BounceOverview) -> Result<u64> {
        self.modify(|t| t.upsert(overview))
    }

    fn find_by_uid_mailbox(&self, uid: u32, mailbox: &str) -> Result<Option<BounceRecord>> {
        self.load()?.find_by_uid_mailbox(uid, mailbox)
    }

    fn find_latest_parsed_flag(&self, uid: Option<u32>, mailbox: &str) -> Result<Option<bool>> {
        self.load()?.find_latest_parsed_flag(uid, mailbox)
    }

    fn update_parsed_fields(
        &mut self,
        uid: u32,
        mailbox: &str,
        fields: &DsnFields,
    ) -> Result<usize> {
        self.modify(|t| t.update_parsed_fields(uid, mailbox, fields))
    }

    fn unparsed_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<BounceRecord>> {
        self.load()?.unparsed_older_than(cutoff)
    }

    fn records(&self) -> Result<Vec<BounceRecord>> {
        self.load()?.records()
    }

    fn truncate(&mut self) -> Result<()> {
        let _guard = self.write_lock().acquire(WRITE_LOCK_WAIT)?;
        self.save(&MemoryStore::new())?;
        info!(path = %self.path.display(), "Store truncated");
        Ok(())
    }
}
