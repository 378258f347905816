//! The bounce table: overview rows written at ingestion, DSN fields at parse time.

pub mod file;
pub mod format;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::bounce::{BounceOverview, BounceRecord, DsnFields};

pub use file::FileStore;

/// Record store operations used by ingestion and parse jobs.
///
/// Writes are last-write-wins; nothing locks individual records.
pub trait BounceStore {
    /// Insert a new unparsed row, or refresh the overview columns of the row
    /// with the same hash. Returns the row id.
    fn upsert(&mut self, overview: &BounceOverview) -> Result<u64>;

    /// Newest row for `uid` in `mailbox`.
    fn find_by_uid_mailbox(&self, uid: u32, mailbox: &str) -> Result<Option<BounceRecord>>;

    /// `parsed` flag of the newest row in `mailbox` whose uid is `uid` or absent.
    fn find_latest_parsed_flag(&self, uid: Option<u32>, mailbox: &str) -> Result<Option<bool>>;

    /// Write DSN fields to every row for `uid` in `mailbox` and mark them
    /// parsed. Returns the number of rows touched.
    fn update_parsed_fields(&mut self, uid: u32, mailbox: &str, fields: &DsnFields)
        -> Result<usize>;

    /// Unparsed rows with a uid, last updated before `cutoff`, oldest first.
    fn unparsed_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<BounceRecord>>;

    /// All rows, newest first.
    fn records(&self) -> Result<Vec<BounceRecord>>;

    /// Remove every row and reset ids.
    fn truncate(&mut self) -> Result<()>;
}

/// In-memory table holding the row logic shared by every store.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStore {
    records: Vec<BounceRecord>,
    next_id: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(records: Vec<BounceRecord>, next_id: u64) -> Self {
        let floor = records.iter().map(|r| r.id + 1).max().unwrap_or(1);
        Self {
            records,
            next_id: next_id.max(floor),
        }
    }

    pub(crate) fn rows(&self) -> &[BounceRecord] {
        &self.records
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn upsert_at(&mut self, overview: &BounceOverview, now: DateTime<Utc>) -> u64 {
        let hash = overview.hash();
        if let Some(existing) = self.records.iter_mut().find(|r| r.hash == hash) {
            existing.refresh_overview(overview, now);
            return existing.id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.records.push(BounceRecord::from_overview(id, overview, now));
        id
    }

    fn update_at(
        &mut self,
        uid: u32,
        mailbox: &str,
        fields: &DsnFields,
        now: DateTime<Utc>,
    ) -> usize {
        let mut touched = 0;
        for record in self
            .records
            .iter_mut()
            .filter(|r| r.uid == Some(uid) && r.mailbox == mailbox)
        {
            record.apply_dsn_fields(fields, now);
            touched += 1;
        }
        touched
    }
}

impl BounceStore for MemoryStore {
    fn upsert(&mut self, overview: &BounceOverview) -> Result<u64> {
        Ok(self.upsert_at(overview, Utc::now()))
    }

    fn find_by_uid_mailbox(&self, uid: u32, mailbox: &str) -> Result<Option<BounceRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.uid == Some(uid) && r.mailbox == mailbox)
            .max_by_key(|r| r.id)
            .cloned())
    }

    fn find_latest_parsed_flag(&self, uid: Option<u32>, mailbox: &str) -> Result<Option<bool>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.mailbox == mailbox && (r.uid.is_none() || r.uid == uid))
            .max_by_key(|r| r.id)
            .map(|r| r.parsed))
    }

    fn update_parsed_fields(
        &mut self,
        uid: u32,
        mailbox: &str,
        fields: &DsnFields,
    ) -> Result<usize> {
        Ok(self.update_at(uid, mailbox, fields, Utc::now()))
    }

    fn unparsed_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<BounceRecord>> {
        let mut stale: Vec<BounceRecord> = self
            .records
            .iter()
            .filter(|r| !r.parsed && r.uid.is_some() && r.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|r| (r.updated_at, r.id));
        Ok(stale)
    }

    fn records(&self) -> Result<Vec<BounceRecord>> {
        let mut all = self.records.clone();
        all.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(all)
    }

    fn truncate(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}
