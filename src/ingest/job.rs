//! Per-UID parse jobs: fetch one message, extract its DSN, update the store.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::imap::{open_session, MailSession};
use crate::ingest::queue::ParseJob;
use crate::ingest::Runtime;
use crate::model::bounce::DsnFields;
use crate::parser::{self, mapper::MapperOptions};
use crate::store::BounceStore;

/// Result of one parse job. None of these are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The DSN was parsed and `rows` records were updated.
    Updated { rows: usize, fields: DsnFields },
    /// The message holds no recognizable delivery report; the record stays
    /// unparsed.
    NoDsn,
    /// The UID no longer exists in the mailbox.
    UidGone,
}

/// Summary of a batch of due jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobBatchReport {
    pub updated: usize,
    pub no_dsn: usize,
    pub gone: usize,
    pub failed: usize,
}

impl JobBatchReport {
    pub fn total(&self) -> usize {
        self.updated + self.no_dsn + self.gone + self.failed
    }
}

/// Note stored as last error when a job finds no report.
pub fn no_dsn_note(uid: u32, mailbox: &str) -> String {
    format!("Parse: no message/delivery-status found (uid {uid}, mailbox {mailbox})")
}

/// Resolve `uid`, fetch the message, and apply its DSN fields to the store.
pub fn parse_uid(
    session: &mut dyn MailSession,
    store: &mut dyn BounceStore,
    uid: u32,
    mailbox: &str,
    options: &MapperOptions,
) -> Result<JobOutcome> {
    let Some(msgno) = session.resolve_uid(uid)? else {
        debug!(uid, mailbox, "UID no longer in mailbox");
        return Ok(JobOutcome::UidGone);
    };
    debug!(uid, msgno, mailbox, "Resolved UID");

    let raw = session.fetch_message(msgno)?;
    let Some(extraction) = parser::extract(&raw, options) else {
        return Ok(JobOutcome::NoDsn);
    };

    let fields = extraction.fields;
    debug!(
        uid,
        part = %extraction.part.address,
        sender = %fields.sender,
        recipient = %fields.final_recipient,
        "Mapped DSN fields"
    );
    let rows = store.update_parsed_fields(uid, mailbox, &fields)?;
    Ok(JobOutcome::Updated { rows, fields })
}

/// Run one parse job in a session of its own.
///
/// A job whose report is missing records a note as the last error, and so
/// does a failed store write before it is returned.
pub fn run_parse_job(
    rt: &Runtime<'_>,
    store: &mut dyn BounceStore,
    uid: u32,
    mailbox: &str,
) -> Result<JobOutcome> {
    let plan = rt.plan(mailbox)?;
    let mut session = open_session(rt.connector, &plan)?;
    let outcome = match parse_uid(&mut *session, store, uid, mailbox, &rt.mapper_options()) {
        Ok(outcome) => outcome,
        Err(e) if e.is_store() => {
            warn!(uid, mailbox, error = %e, "Could not store parsed fields");
            rt.status_file().record_error(&format!("Store error: {e}"))?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match &outcome {
        JobOutcome::Updated { rows, .. } => info!(uid, mailbox, rows, "Bounce parsed"),
        JobOutcome::NoDsn => {
            warn!(uid, mailbox, "No delivery report found");
            rt.status_file().record_error(&no_dsn_note(uid, mailbox))?;
        }
        JobOutcome::UidGone => info!(uid, mailbox, "Message gone, nothing to parse"),
    }
    Ok(outcome)
}

/// Run every job due now. Failures are logged and counted; the batch goes on.
///
/// `progress` is called with `(done, total)` after each job.
pub fn run_due_jobs(
    rt: &Runtime<'_>,
    store: &mut dyn BounceStore,
    progress: Option<&dyn Fn(u64, u64)>,
) -> Result<JobBatchReport> {
    let mut queue = rt.queue()?;
    let due: Vec<ParseJob> = queue.take_due(Utc::now());
    queue.save()?;

    let mut report = JobBatchReport::default();
    let total = due.len() as u64;
    for (done, job) in due.iter().enumerate() {
        match run_parse_job(rt, store, job.uid, &job.mailbox) {
            Ok(JobOutcome::Updated { .. }) => report.updated += 1,
            Ok(JobOutcome::NoDsn) => report.no_dsn += 1,
            Ok(JobOutcome::UidGone) => report.gone += 1,
            Err(e) => {
                warn!(uid = job.uid, mailbox = %job.mailbox, error = %e, "Parse job failed");
                report.failed += 1;
            }
        }
        if let Some(cb) = progress {
            cb(done as u64 + 1, total);
        }
    }
    Ok(report)
}
