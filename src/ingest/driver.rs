//! `run_check`: find unseen bounces, record their overviews, schedule parses.

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{BounceError, Result};
use crate::imap::{open_session, ConnectionPlan, MessageOverview};
use crate::ingest::queue::{due_at, JobQueue, ParseJob};
use crate::ingest::Runtime;
use crate::model::bounce::BounceOverview;
use crate::store::BounceStore;

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Unseen messages matching the subject filter.
    pub found: usize,
    pub upserted: usize,
    pub scheduled: usize,
    pub skipped_parsed: usize,
    pub skipped_scheduled: usize,
    /// The deadline passed and IMAP work stopped early.
    pub timed_out: bool,
    /// Last store failure; the run carried on past it.
    pub store_error: Option<String>,
}

/// One ingestion run under the run lock.
///
/// Returns [`BounceError::Locked`] without side effects when another run
/// holds the lock. Configuration and connection failures are stored as the
/// last error (credentials redacted) and returned; a clean run stores the
/// count, the run time, and clears the last error. With a `deadline`, no
/// IMAP work starts after it passes and the partial result counts as a
/// success.
pub fn run_check(
    rt: &Runtime<'_>,
    store: &mut dyn BounceStore,
    deadline: Option<Instant>,
) -> Result<RunReport> {
    let lock = rt.run_lock();
    let Some(_guard) = lock.try_acquire()? else {
        return Err(BounceError::Locked(lock.path().display().to_string()));
    };
    let status = rt.status_file();

    let plan = match rt.plan(rt.mailbox()) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(error = %e, "Run aborted before connecting");
            status.record_error(&e.to_string())?;
            return Err(e);
        }
    };

    let mut queue = rt.queue()?;
    let mut report = RunReport::default();
    if let Err(e) = scan(rt, &plan, store, &mut queue, deadline, &mut report) {
        let message = plan.redact(&e.to_string());
        warn!(error = %message, "Run failed");
        status.record_error(&message)?;
        return Err(e);
    }

    if let Err(e) = queue.save() {
        warn!(error = %e, "Could not save job queue");
        report.store_error = Some(format!("Queue error: {e}"));
    }

    let finished = rt.config.site_timezone().convert(&Utc::now());
    status.record_success(report.found, finished, report.store_error.as_deref())?;
    info!(
        found = report.found,
        scheduled = report.scheduled,
        timed_out = report.timed_out,
        "Run complete"
    );
    Ok(report)
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn scan(
    rt: &Runtime<'_>,
    plan: &ConnectionPlan,
    store: &mut dyn BounceStore,
    queue: &mut JobQueue,
    deadline: Option<Instant>,
    report: &mut RunReport,
) -> Result<()> {
    if past(deadline) {
        report.timed_out = true;
        return Ok(());
    }
    let mut session = open_session(rt.connector, plan)?;

    if past(deadline) {
        report.timed_out = true;
        return Ok(());
    }
    let uids = session.search_unseen(&rt.config.watcher.subject)?;
    report.found = uids.len();
    debug!(count = uids.len(), "Unseen matches");
    if uids.is_empty() {
        return Ok(());
    }

    if past(deadline) {
        report.timed_out = true;
        return Ok(());
    }
    let overviews = session.fetch_overviews(&uids)?;
    drop(session);

    let mailbox = rt.mailbox();
    for ov in &overviews {
        let overview = overview_record(ov, mailbox, plan);
        match store.upsert(&overview) {
            Ok(id) => {
                debug!(id, uid = ov.uid, "Overview stored");
                report.upserted += 1;
            }
            Err(e) => {
                warn!(uid = ov.uid, error = %e, "Could not store overview");
                report.store_error = Some(format!("Store error: {e}"));
            }
        }
    }

    schedule_jobs(rt, store, queue, &overviews, report);
    Ok(())
}

/// Overview row for `ov`. Sender and recipient are left for the parse job.
fn overview_record(ov: &MessageOverview, mailbox: &str, plan: &ConnectionPlan) -> BounceOverview {
    BounceOverview {
        message_id: ov.message_id.clone(),
        uid: (ov.uid != 0).then_some(ov.uid),
        mailbox: mailbox.to_string(),
        subject: ov.subject.clone(),
        from_email: None,
        to_email: None,
        imap_date: ov.date,
        unseen: !ov.seen,
        source_host: Some(plan.host().to_string()),
        source_user: Some(plan.user.clone()),
    }
}

/// Queue parse jobs for new messages, `delay_step` apart, at most `max_jobs`.
fn schedule_jobs(
    rt: &Runtime<'_>,
    store: &dyn BounceStore,
    queue: &mut JobQueue,
    overviews: &[MessageOverview],
    report: &mut RunReport,
) {
    let mailbox = rt.mailbox();
    let start = Utc::now();

    for ov in overviews {
        if report.scheduled >= rt.config.schedule.max_jobs {
            break;
        }
        if ov.msgno == 0 || ov.uid == 0 {
            continue;
        }
        match store.find_latest_parsed_flag(Some(ov.uid), mailbox) {
            Ok(Some(true)) => {
                report.skipped_parsed += 1;
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(uid = ov.uid, error = %e, "Could not read parsed flag");
                report.store_error = Some(format!("Store error: {e}"));
            }
        }
        if queue.is_scheduled(ov.uid, mailbox) {
            report.skipped_scheduled += 1;
            continue;
        }

        queue.schedule(ParseJob {
            uid: ov.uid,
            mailbox: mailbox.to_string(),
            due_at: due_at(start, rt.config.schedule.delay_step_secs, report.scheduled + 1),
        });
        report.scheduled += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ingest::testing::{self, FakeConnector};
    use crate::model::bounce::DsnFields;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const SUBJECT: &str = "Undelivered Mail Returned to Sender";

    fn runtime<'a>(
        config: &'a Config,
        connector: &'a FakeConnector,
        dir: &std::path::Path,
    ) -> Runtime<'a> {
        Runtime {
            config,
            upstream: testing::upstream(),
            decryptor: &testing::PLAIN,
            connector,
            data_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_run_records_and_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        {
            let mut mailbox = connector.mailbox.borrow_mut();
            mailbox.add(3, SUBJECT, &testing::postfix_bounce("a@b.com"));
            mailbox.add(4, SUBJECT, &testing::postfix_bounce("c@d.com"));
            mailbox.add(5, "Weekly newsletter", b"Subject: hi\r\n\r\nhello\r\n");
        }
        let rt = runtime(&config, &connector, dir.path());
        let mut store = MemoryStore::new();

        let before = Utc::now();
        let report = run_check(&rt, &mut store, None).unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.upserted, 2);
        assert_eq!(report.scheduled, 2);

        let records = store.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.parsed && r.unseen));
        assert_eq!(records[0].source_host.as_deref(), Some("mail.example.org"));
        assert_eq!(records[0].source_user.as_deref(), Some("bounces@example.org"));

        let queue = rt.queue().unwrap();
        let jobs = queue.pending();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].uid, 3);
        assert!(jobs[0].due_at >= before + chrono::Duration::seconds(10));
        assert!(jobs[1].due_at - jobs[0].due_at == chrono::Duration::seconds(10));

        let status = rt.status_file().load();
        assert_eq!(status.count, 2);
        assert_eq!(status.last_error, "");
        assert!(status.last_run.is_some());
        assert!(!rt.run_lock().path().exists());
        assert_eq!(connector.mailbox.borrow().logouts, 1);
    }

    #[test]
    fn test_second_run_skips_scheduled_and_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        {
            let mut mailbox = connector.mailbox.borrow_mut();
            mailbox.add(3, SUBJECT, &testing::postfix_bounce("a@b.com"));
            mailbox.add(4, SUBJECT, &testing::postfix_bounce("c@d.com"));
        }
        let rt = runtime(&config, &connector, dir.path());
        let mut store = MemoryStore::new();
        run_check(&rt, &mut store, None).unwrap();

        // uid 3 got parsed and its job consumed; uid 4 is still queued.
        store
            .update_parsed_fields(3, "INBOX", &DsnFields::default())
            .unwrap();
        let mut queue = rt.queue().unwrap();
        queue.take_due(Utc::now() + chrono::Duration::seconds(15));
        queue.save().unwrap();

        let report = run_check(&rt, &mut store, None).unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.skipped_parsed, 1);
        assert_eq!(report.skipped_scheduled, 1);
        assert_eq!(store.records().unwrap().len(), 2);
    }

    #[test]
    fn test_job_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.schedule.max_jobs = 2;
        let connector = FakeConnector::default();
        for uid in 1..=5 {
            connector
                .mailbox
                .borrow_mut()
                .add(uid, SUBJECT, &testing::postfix_bounce("a@b.com"));
        }
        let rt = runtime(&config, &connector, dir.path());
        let mut store = MemoryStore::new();

        let report = run_check(&rt, &mut store, None).unwrap();
        assert_eq!(report.found, 5);
        assert_eq!(report.upserted, 5);
        assert_eq!(report.scheduled, 2);
    }

    #[test]
    fn test_empty_search_is_a_clean_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        let rt = runtime(&config, &connector, dir.path());
        rt.status_file().record_error("old failure").unwrap();

        let report = run_check(&rt, &mut MemoryStore::new(), None).unwrap();
        assert_eq!(report, RunReport::default());
        let status = rt.status_file().load();
        assert_eq!(status.count, 0);
        assert_eq!(status.last_error, "");
    }

    #[test]
    fn test_configuration_error_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        let mut rt = runtime(&config, &connector, dir.path());
        rt.upstream = crate::upstream::UpstreamOptions::from_json(
            r#"{"mail": {"mailer": "sendmail"}, "smtp": {"host": "h", "port": 25}}"#,
        )
        .unwrap();

        let err = run_check(&rt, &mut MemoryStore::new(), None).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(connector.mailbox.borrow().opens, 0);
        let status = rt.status_file().load();
        assert_eq!(status.last_error, err.to_string());
        assert!(status.last_run.is_none());
        assert!(!rt.run_lock().path().exists());
    }

    #[test]
    fn test_connection_error_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        connector.mailbox.borrow_mut().fail_open =
            Some("LOGIN bounces@example.org s3cret rejected".into());
        let rt = runtime(&config, &connector, dir.path());

        assert!(run_check(&rt, &mut MemoryStore::new(), None).is_err());
        let stored = rt.status_file().load().last_error;
        assert!(stored.contains("[redacted-username]"));
        assert!(stored.contains("[redacted-password]"));
        assert!(!stored.contains("s3cret"));
    }

    #[test]
    fn test_search_error_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        connector.mailbox.borrow_mut().fail_search = Some("SEARCH failed".into());
        let rt = runtime(&config, &connector, dir.path());

        let err = run_check(&rt, &mut MemoryStore::new(), None).unwrap_err();
        assert!(matches!(err, BounceError::Protocol(_)));
        assert!(rt.status_file().load().last_error.contains("SEARCH failed"));
        assert_eq!(connector.mailbox.borrow().logouts, 1);
    }

    #[test]
    fn test_locked_run_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        let rt = runtime(&config, &connector, dir.path());
        let _held = rt.run_lock().try_acquire().unwrap().unwrap();

        let err = run_check(&rt, &mut MemoryStore::new(), None).unwrap_err();
        assert!(matches!(err, BounceError::Locked(_)));
        assert_eq!(connector.mailbox.borrow().opens, 0);
        assert!(!rt.status_file().path().exists());
    }

    #[test]
    fn test_expired_deadline_stops_before_imap() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let connector = FakeConnector::default();
        connector
            .mailbox
            .borrow_mut()
            .add(1, SUBJECT, &testing::postfix_bounce("a@b.com"));
        let rt = runtime(&config, &connector, dir.path());

        let deadline = Instant::now() - Duration::from_millis(1);
        let report = run_check(&rt, &mut MemoryStore::new(), Some(deadline)).unwrap();
        assert!(report.timed_out);
        assert_eq!(report.found, 0);
        assert_eq!(connector.mailbox.borrow().opens, 0);
    }
}
